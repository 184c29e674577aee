//! Integration profiles: what each inbound endpoint binds together.
//!
//! A profile fixes the trigger and marker rules, the tool servers, the instruction template,
//! an optional output schema, and how interim, final and error messages are worded for its
//! platform. Profiles are built once from config and shared read-only.

use crate::agent::{AgentError, AgentInput, AgentResponse, OutputSchema, Turn};
use crate::channels::{CHATWORK_CHANNEL_ID, SLACK_CHANNEL_ID};
use crate::config::{Config, IntegrationConfig};
use crate::filter::FilterRules;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const NEWS_MODEL: &str = "gpt-4o";

/// Marker carried by every Chatwork message we post.
pub const CHATWORK_AI_MARKER: &str = "AIからの回答";

const CHATWORK_INSTRUCTIONS: &str = "\
Playwrightを使って指定のURLを解析できます
Perplexityで調べものもできます
Perplexityにリクエストを送るときは、メッセージはuserで終わり、system以降はuserとassistantが交互になるように構造を整えてください
Chatworkを使って機能を拡張できます。
Chatworkの装飾タグは使わないでください
出力の最後に、どのツールを使ってどうやって回答したかを詳細に記述してください。
全部日本語で出力してください";

const SLACK_INSTRUCTIONS: &str = "\
あなたはSlackを使って様々なリクエストをハンドリングします
Perplexityで調べものもできます
Markdownフォーマットは使わず、Slackの```にきれいに入るフラットテキストで出してください。
出力の最後に、どのツールを使ったかを記述してください。
全部日本語で出力してください";

const CRM_INSTRUCTIONS: &str = "\
Airtableを使ってデータを取得できます
Airtableのベースは「8M CRM」を使ってください
どのツールのコマンドを使ったか出力に含めてください
summaryに要約、contentに回答本文、keywordsに検索語、sqlに実行したクエリ相当の記述を入れてください
全部日本語で出力してください";

const NEWS_INSTRUCTIONS: &str = "\
あなたは2つのツール（PerplexityとSlack）を使えるエージェントです。

以下のプロセスに従ってください：

1. 指定されたトピックでPerplexityツールを呼び出し、ここ3日以内に公開されたニュースを10件取得してください。
2. 各ニュースについて以下のフォーマットで整形してください：

【トピック名】

1. タイトル
日付: YYYY-MM-DD
サマリー: （500文字程度）
リンク: https://... (記事に直接飛べるリンク)

3. Markdownは使わず、Slackの ``` で囲んでください。
4. 取得したニュース一覧を、指定されたSlackチャンネルに投稿してください。
5. 日付は記事の公開された年月日を入れてください
6. リンク先は記事に飛べるディープリンクにしてください
7. 出力はすべて日本語で書いてください。";

/// Slack channel the news digest goes to when none is given.
pub const DEFAULT_NEWS_CHANNEL: &str = "askai_test";

/// Prompt for one news digest run: the topic plus the channel the agent should post to.
pub fn news_prompt(topic: &str, channel: &str) -> String {
    format!(
        "トピック: {}\n投稿先Slackチャンネル: #{}",
        topic.trim(),
        channel.trim().trim_start_matches('#')
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntegrationKind {
    Chatwork,
    Slack,
    Crm,
    News,
}

impl IntegrationKind {
    pub const ALL: [IntegrationKind; 4] = [
        IntegrationKind::Chatwork,
        IntegrationKind::Slack,
        IntegrationKind::Crm,
        IntegrationKind::News,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Chatwork => "chatwork",
            IntegrationKind::Slack => "slack",
            IntegrationKind::Crm => "crm",
            IntegrationKind::News => "news",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s.trim())
    }

    fn config<'a>(&self, config: &'a Config) -> &'a IntegrationConfig {
        match self {
            IntegrationKind::Chatwork => &config.integrations.chatwork,
            IntegrationKind::Slack => &config.integrations.slack,
            IntegrationKind::Crm => &config.integrations.crm,
            IntegrationKind::News => &config.integrations.news,
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CRM answer schema. Version 1 keeps `sql` as a single string; version 2 (default) is a list.
pub fn crm_schema(version: u32) -> Value {
    let sql = if version == 1 {
        json!({ "type": "string" })
    } else {
        json!({ "type": "array", "items": { "type": "string" } })
    };
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "content": { "type": "string" },
            "keywords": { "type": "array", "items": { "type": "string" } },
            "sql": sql
        },
        "required": ["summary", "content", "keywords", "sql"],
        "additionalProperties": false
    })
}

#[derive(Debug, Clone)]
pub struct Integration {
    pub kind: IntegrationKind,
    /// Outbound channel id; None for integrations that only run from the CLI.
    pub channel: Option<&'static str>,
    pub rules: FilterRules,
    pub servers: Vec<String>,
    pub instructions: String,
    pub output_schema: Option<OutputSchema>,
    pub model: String,
}

impl Integration {
    /// Built-in profile with config overrides applied.
    pub fn from_config(kind: IntegrationKind, config: &Config) -> Result<Self, AgentError> {
        let overrides = kind.config(config);
        let (channel, trigger, marker, servers, instructions, default_model): (
            Option<&'static str>,
            &str,
            &str,
            &[&str],
            &str,
            &str,
        ) = match kind {
            IntegrationKind::Chatwork => (
                Some(CHATWORK_CHANNEL_ID),
                "/ask",
                CHATWORK_AI_MARKER,
                &["perplexity-ask", "playwright", "chatwork"],
                CHATWORK_INSTRUCTIONS,
                DEFAULT_MODEL,
            ),
            IntegrationKind::Slack => (
                Some(SLACK_CHANNEL_ID),
                "/askai",
                "",
                &["slack", "perplexity-ask"],
                SLACK_INSTRUCTIONS,
                DEFAULT_MODEL,
            ),
            IntegrationKind::Crm => (
                Some(SLACK_CHANNEL_ID),
                "/crm",
                "",
                &["slack", "airtable"],
                CRM_INSTRUCTIONS,
                DEFAULT_MODEL,
            ),
            IntegrationKind::News => (
                None,
                "",
                "",
                &["perplexity-ask", "slack"],
                NEWS_INSTRUCTIONS,
                NEWS_MODEL,
            ),
        };
        let output_schema = match kind {
            IntegrationKind::Crm => {
                let version = overrides.schema_version.unwrap_or(2);
                Some(OutputSchema::new(
                    format!("crm_answer_v{}", version),
                    crm_schema(version),
                )?)
            }
            _ => None,
        };
        let model = overrides
            .model
            .clone()
            .or_else(|| match kind {
                IntegrationKind::News => None,
                _ => config.agent.model.clone(),
            })
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model.to_string());

        Ok(Self {
            kind,
            channel,
            rules: FilterRules {
                trigger: overrides.trigger.clone().unwrap_or_else(|| trigger.to_string()),
                ai_marker: marker.to_string(),
            },
            servers: overrides
                .servers
                .clone()
                .unwrap_or_else(|| servers.iter().map(|s| s.to_string()).collect()),
            instructions: instructions.to_string(),
            output_schema,
            model,
        })
    }

    /// Structured integrations send the prompt as a conversation turn.
    pub fn agent_input(&self, prompt: &str) -> AgentInput {
        if self.output_schema.is_some() {
            AgentInput::Turns(vec![Turn {
                role: "user".to_string(),
                content: prompt.to_string(),
            }])
        } else {
            AgentInput::Text(prompt.to_string())
        }
    }

    /// Acknowledgment posted before the agent runs.
    pub fn interim_text(&self, prompt: &str) -> String {
        match self.kind {
            IntegrationKind::Chatwork => format!("{}を取得中です...", CHATWORK_AI_MARKER),
            IntegrationKind::Slack => fenced(&format!(
                "プロンプト： {} {}\n\n AIに問い合わせ中...",
                self.rules.trigger, prompt
            )),
            IntegrationKind::Crm => fenced(&format!(
                "プロンプト： {} {}\n\n CRMに問い合わせ中...",
                self.rules.trigger, prompt
            )),
            IntegrationKind::News => format!("ニュースを取得中です: {}", prompt),
        }
    }

    /// The answer as posted to the channel.
    pub fn final_text(&self, response: &AgentResponse) -> String {
        let body = render_response(response);
        match self.kind {
            IntegrationKind::Chatwork => format!("{}：\n\n{}", CHATWORK_AI_MARKER, body),
            IntegrationKind::Slack | IntegrationKind::Crm => fenced(&body),
            IntegrationKind::News => body,
        }
    }

    /// Error report posted instead of an answer.
    pub fn error_text(&self, error: &dyn fmt::Display) -> String {
        let body = format!("エラーが発生しました: {}", error);
        match self.kind {
            // Keep the marker so the report never re-triggers the filter.
            IntegrationKind::Chatwork => format!("{}：\n\n[code]{}[/code]", CHATWORK_AI_MARKER, body),
            IntegrationKind::Slack | IntegrationKind::Crm => fenced(&body),
            IntegrationKind::News => body,
        }
    }
}

/// Text answers as-is; structured answers by their `content` field, or the whole object.
fn render_response(response: &AgentResponse) -> String {
    match response {
        AgentResponse::Text(text) => text.clone(),
        AgentResponse::Structured(value) => match value.get("content").and_then(Value::as_str) {
            Some(content) => content.to_string(),
            None => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        },
    }
}

fn fenced(text: &str) -> String {
    format!("```\n{}\n```", text.trim_end())
}

/// Every enabled profile, keyed by kind.
#[derive(Debug, Clone, Default)]
pub struct Integrations {
    profiles: Vec<Arc<Integration>>,
}

impl Integrations {
    pub fn from_config(config: &Config) -> Result<Self, AgentError> {
        let mut profiles = Vec::new();
        for kind in IntegrationKind::ALL {
            if !kind.config(config).enabled {
                log::info!("integration disabled: integration={}", kind);
                continue;
            }
            profiles.push(Arc::new(Integration::from_config(kind, config)?));
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, kind: IntegrationKind) -> Option<Arc<Integration>> {
        self.profiles.iter().find(|p| p.kind == kind).cloned()
    }

    pub fn insert(&mut self, integration: Integration) {
        self.profiles.retain(|p| p.kind != integration.kind);
        self.profiles.push(Arc::new(integration));
    }

    /// All tool servers referenced by enabled profiles.
    pub fn referenced_servers(&self) -> impl Iterator<Item = (IntegrationKind, &str)> {
        self.profiles
            .iter()
            .flat_map(|p| p.servers.iter().map(move |s| (p.kind, s.as_str())))
    }
}
