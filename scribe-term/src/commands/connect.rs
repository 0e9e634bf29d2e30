//! Connect command implementation.
//!
//! Every stdin line is appended to the shared document. Lines starting with
//! `:` are commands (`:quit`, `:clear`, `:status`, `:disconnect`,
//! `:reconnect`). Remote changes are printed as they arrive.

use std::time::Duration;

use scribe_sync::{ClientConfig, ConfigError, Connectivity, SyncClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

/// Command-line overrides on top of the `SCRIBE_*` environment.
pub struct Options {
    pub url: Option<String>,
    pub session: Option<String>,
    pub token: Option<String>,
    pub no_reconnect: bool,
    pub reconnect_ms: Option<u64>,
}

impl Options {
    fn into_config(self) -> Result<ClientConfig, ConfigError> {
        let mut config = ClientConfig::from_env()?;
        if let Some(url) = self.url {
            config.base_url = url;
        }
        if let Some(session) = self.session {
            config.session = session;
        }
        if self.token.is_some() {
            config.token = self.token;
        }
        if self.no_reconnect {
            config.reconnect = false;
        }
        if let Some(ms) = self.reconnect_ms {
            config.reconnect_interval = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Append(&'a str),
    Clear,
    Status,
    Disconnect,
    Reconnect,
    Quit,
    Unknown(&'a str),
}

impl<'a> Input<'a> {
    fn parse(line: &'a str) -> Self {
        match line.trim_end() {
            ":quit" | ":q" => Input::Quit,
            ":clear" => Input::Clear,
            ":status" => Input::Status,
            ":disconnect" => Input::Disconnect,
            ":reconnect" => Input::Reconnect,
            other if other.starts_with(':') && !other.starts_with("::") => Input::Unknown(other),
            // A leading "::" escapes a literal colon.
            other => Input::Append(other.strip_prefix(':').unwrap_or(other)),
        }
    }
}

fn describe(connectivity: Connectivity) -> &'static str {
    match connectivity {
        Connectivity::Disconnected => "disconnected",
        Connectivity::Syncing => "syncing",
        Connectivity::Synced => "synced",
    }
}

/// Join a session and edit it until stdin ends or `:quit`.
pub async fn run(options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.into_config()?;
    println!("Joining session {:?} at {}", config.session, config.base_url);

    let client = SyncClient::start(config)?;
    let printer = tokio::spawn(print_updates(client.watch_text(), client.watch_connectivity()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Input::parse(&line) {
            Input::Quit => break,
            Input::Clear => client.replace_text("").await?,
            Input::Status => println!(
                "[{}] {} chars",
                describe(client.connectivity()),
                client.text().chars().count()
            ),
            Input::Disconnect => client.disconnect(),
            Input::Reconnect => client.reconnect(),
            Input::Unknown(command) => println!(
                "Unknown command {command}; try :quit :clear :status :disconnect :reconnect"
            ),
            Input::Append(text) => client.append(format!("{text}\n")).await?,
        }
    }

    printer.abort();
    client.shutdown().await;
    Ok(())
}

async fn print_updates(
    mut text: watch::Receiver<String>,
    mut connectivity: watch::Receiver<Connectivity>,
) {
    println!("[{}]", describe(*connectivity.borrow_and_update()));
    loop {
        tokio::select! {
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("[{}]", describe(*connectivity.borrow_and_update()));
            }
            changed = text.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = text.borrow_and_update().clone();
                println!("----- document -----\n{current}--------------------");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Input::parse(":quit"), Input::Quit);
        assert_eq!(Input::parse(":q\r"), Input::Quit);
        assert_eq!(Input::parse(":clear"), Input::Clear);
        assert_eq!(Input::parse(":status"), Input::Status);
        assert_eq!(Input::parse(":disconnect"), Input::Disconnect);
        assert_eq!(Input::parse(":reconnect"), Input::Reconnect);
        assert_eq!(Input::parse(":nope"), Input::Unknown(":nope"));
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(Input::parse("hello world"), Input::Append("hello world"));
        assert_eq!(Input::parse(""), Input::Append(""));
        assert_eq!(Input::parse("::quit"), Input::Append(":quit"));
    }

    #[test]
    fn test_cli_overrides_environment_defaults() {
        let options = Options {
            url: Some("ws://10.1.1.1:9001".into()),
            session: Some("meeting".into()),
            token: Some("abc".into()),
            no_reconnect: true,
            reconnect_ms: Some(500),
        };
        let config = options.into_config().unwrap();
        assert_eq!(config.base_url, "ws://10.1.1.1:9001");
        assert_eq!(config.session, "meeting");
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert!(!config.reconnect);
        assert_eq!(config.reconnect_interval, Duration::from_millis(500));
    }
}
