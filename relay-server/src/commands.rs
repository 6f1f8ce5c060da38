//! Slash commands: the chat-side flows that create, inspect and delete sessions.
//!
//! - `/start`: greeting and setup instructions
//! - `/register`: validate credentials upstream, then upsert a fresh session
//! - `/test`: report upstream connectivity and credential validity
//! - `/forget`: delete the channel's session
//! - `/help`: list commands
//!
//! Handlers return the reply text; the HTTP layer wraps it for Slack.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use relay_core::{AlertSource, Credentials, Session, SessionStore};

/// One parsed slash-command invocation.
#[derive(Debug, Clone, Default)]
pub struct SlashCommand {
    pub command: String,
    pub text: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterArgsError {
    Missing,
    ClientIdNotNumeric(String),
}

#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<dyn SessionStore>,
    source: Arc<dyn AlertSource>,
    dashboard_url: String,
}

impl CommandHandler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        source: Arc<dyn AlertSource>,
        dashboard_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source,
            dashboard_url: dashboard_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn handle(&self, cmd: &SlashCommand) -> Result<String> {
        tracing::info!(command = %cmd.command, channel_id = %cmd.channel_id, "Slash command received");

        match cmd.command.trim_start_matches('/') {
            "start" => Ok(self.start_text()),
            "register" => self.register(cmd).await,
            "test" => self.test(cmd).await,
            "forget" => self.forget(cmd).await,
            "help" => Ok(help_text()),
            other => Ok(format!(
                "I don't know the command `/{}`. Try `/help`.",
                other
            )),
        }
    }

    fn start_text(&self) -> String {
        format!(
            "Hi there :wave: I'll post your dashboard alerts in this channel.\n\n\
             1. Grab your client id and API key from <{}/dashboard/profile/|your profile>\n\
             2. Run `/register <clientId> <apiKey>` here\n\n\
             Use `/help` to see everything I can do.",
            self.dashboard_url
        )
    }

    async fn register(&self, cmd: &SlashCommand) -> Result<String> {
        let (client_id, api_key) = match parse_register_args(&cmd.text) {
            Ok(args) => args,
            Err(RegisterArgsError::Missing) => {
                return Ok(
                    "Sorry, something isn't right. Use `/register <clientId> <apiKey>`."
                        .to_string(),
                )
            }
            Err(RegisterArgsError::ClientIdNotNumeric(candidate)) => {
                tracing::warn!(candidate = %candidate, "Client id is not a number");
                return Ok("Sorry, the client id should be a number. Please try again.".to_string());
            }
        };

        let credentials = Credentials { client_id, api_key };
        let ping = self.source.ping(&credentials).await;
        if !ping.authenticated {
            return Ok(
                "I tried those, but they didn't work. Run `/register <clientId> <apiKey>` \
                 again with the values from your profile."
                    .to_string(),
            );
        }

        let session = Session::new(cmd.channel_id.clone(), credentials, Utc::now());
        self.store.save(&session).await?;
        tracing::info!(channel_id = %cmd.channel_id, client_id, "Session registered");

        Ok(format!(
            "Those look correct! Setup complete :white_check_mark:\n\n\
             You'll get notified based on your alert <{}/dashboard/triggers/|triggers>, \
             so make sure you've created some with Slack as their destination.",
            self.dashboard_url
        ))
    }

    async fn test(&self, cmd: &SlashCommand) -> Result<String> {
        let session = match self.store.find_by_id(&cmd.channel_id).await? {
            Some(s) => s,
            None => return Ok("We haven't met yet...".to_string()),
        };

        let ping = self.source.ping(&session.credentials).await;
        Ok(format!(
            "*Connectivity to the dashboard:* {}\n*Authentication with your API credentials:* {}",
            status_glyph(ping.reachable),
            status_glyph(ping.authenticated)
        ))
    }

    async fn forget(&self, cmd: &SlashCommand) -> Result<String> {
        if self.store.delete_by_id(&cmd.channel_id).await? {
            tracing::info!(channel_id = %cmd.channel_id, "Session forgotten");
            Ok("Got it - I won't send you notifications anymore.".to_string())
        } else {
            Ok("I don't think we've met...".to_string())
        }
    }
}

fn status_glyph(ok: bool) -> &'static str {
    if ok {
        ":white_check_mark:"
    } else {
        ":x:"
    }
}

fn help_text() -> String {
    [
        "*Commands*",
        "`/start` - how to get set up",
        "`/register <clientId> <apiKey>` - send alerts for your account to this channel",
        "`/test` - check connectivity and credentials",
        "`/forget` - stop sending alerts to this channel",
        "`/help` - this message",
    ]
    .join("\n")
}

/// Accepts `123 key`, `<123> <key>` and `<123><key>`.
pub fn parse_register_args(text: &str) -> Result<(i64, String), RegisterArgsError> {
    let tokens: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == '<' || c == '>')
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() < 2 {
        return Err(RegisterArgsError::Missing);
    }

    let client_id = tokens[0]
        .parse::<i64>()
        .map_err(|_| RegisterArgsError::ClientIdNotNumeric(tokens[0].to_string()))?;
    Ok((client_id, tokens[1].to_string()))
}
