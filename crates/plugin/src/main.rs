//! Session Manager plugin entry point.
//!
//! Invoked by the AWS CLI with a fixed positional contract: either the
//! 4-argument legacy form or the full 7-argument form
//! `<StartSessionResponse> <Region> <Operation> <Profile>
//! <StartSessionRequest> <SsmEndpoint> <ClientVersion>`. Only the
//! `StartSession` operation is handled. `LOG_LEVEL` selects logger
//! verbosity; logs go to stderr, stdout belongs to the session.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use plugin::config;
use plugin::sdk::{KmsDataKeyProvider, SsmService};
use plugin::session::{port::PortSession, shell::ShellSession, SessionHandler};
use plugin::{Session, SessionParams, SessionRegistry};

/// Positional arguments as passed by the invoking CLI.
#[derive(Parser, Debug)]
#[command(name = "session-manager-plugin", disable_help_flag = true)]
struct Cli {
    /// StartSession response JSON (SessionId, StreamUrl, TokenValue)
    response: String,
    /// AWS region of the session
    region: Option<String>,
    /// Operation name; only StartSession is supported
    operation: Option<String>,
    /// Shared-config profile name
    profile: Option<String>,
    /// StartSession request JSON (Target, DocumentName, Parameters)
    parameters: Option<String>,
    /// SSM endpoint the session was started against
    endpoint: Option<String>,
    /// Version of the invoking client
    client_version: Option<String>,
}

/// Validated inputs for one session.
#[derive(Debug, PartialEq)]
struct PluginArgs {
    response: String,
    region: String,
    operation: String,
    profile: String,
    parameters: String,
    endpoint: String,
    client_version: String,
}

impl PluginArgs {
    /// Accepts the 4- or 7-argument positional forms.
    fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let argument_count = 1
            + [
                &cli.region,
                &cli.operation,
                &cli.profile,
                &cli.parameters,
                &cli.endpoint,
                &cli.client_version,
            ]
            .iter()
            .filter(|arg| arg.is_some())
            .count();

        match argument_count {
            4 | 7 => Ok(Self {
                response: cli.response,
                region: cli.region.unwrap_or_default(),
                operation: cli.operation.unwrap_or_default(),
                profile: cli.profile.unwrap_or_default(),
                parameters: cli.parameters.unwrap_or_default(),
                endpoint: cli.endpoint.unwrap_or_default(),
                client_version: cli
                    .client_version
                    .unwrap_or_else(|| config::CLIENT_VERSION.to_string()),
            }),
            n => bail!("expected 4 or 7 arguments, got {n}"),
        }
    }
}

/// The fields of the StartSession response this binary needs.
#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    #[serde(rename = "SessionId")]
    session_id: String,
    #[serde(rename = "StreamUrl")]
    stream_url: String,
    #[serde(rename = "TokenValue")]
    token_value: String,
}

/// The fields of the StartSession request this binary needs.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartSessionRequest {
    #[serde(rename = "Target")]
    target: String,
}

/// Maps `LOG_LEVEL` to a tracing filter. ALWAYS shares the ERROR level.
fn log_filter_from_env() -> &'static str {
    match std::env::var("LOG_LEVEL").unwrap_or_default().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" => "warn",
        "ERROR" | "ALWAYS" => "error",
        _ => "warn",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter_from_env())
        .with_writer(std::io::stderr)
        .init();

    let args = PluginArgs::from_cli(Cli::parse())?;
    if args.operation != config::START_SESSION_OPERATION {
        bail!("unsupported operation {}", args.operation);
    }

    if !args.region.is_empty() && std::env::var("AWS_REGION").is_err() {
        std::env::set_var("AWS_REGION", &args.region);
    }

    let response: StartSessionResponse = serde_json::from_str(&args.response)
        .context("cannot parse StartSession response")?;
    let request: StartSessionRequest = if args.parameters.is_empty() {
        StartSessionRequest::default()
    } else {
        serde_json::from_str(&args.parameters).context("cannot parse StartSession request")?
    };

    let profile = (!args.profile.is_empty()).then_some(args.profile.as_str());
    let sdk_config = plugin::sdk::load_sdk_config(profile).await;
    let service = Arc::new(SsmService::new(
        &sdk_config,
        (!args.endpoint.is_empty()).then_some(args.endpoint.as_str()),
    ));
    let data_key_provider = Arc::new(KmsDataKeyProvider::new(&sdk_config));

    let registry = Arc::new(
        SessionRegistry::builder()
            .register(config::SHELL_PLUGIN_NAME, || {
                Arc::new(ShellSession::new()) as Arc<dyn SessionHandler>
            })
            .register(config::PORT_PLUGIN_NAME, || {
                Arc::new(PortSession::new()) as Arc<dyn SessionHandler>
            })
            .build(),
    );

    let session = Session::new(SessionParams {
        session_id: response.session_id,
        stream_url: response.stream_url,
        token_value: response.token_value,
        target_id: request.target,
        client_id: Uuid::new_v4().to_string(),
        client_version: args.client_version,
        registry,
        service,
        data_key_provider,
    });

    if let Err(e) = session.execute().await {
        // A session the service or the user already ended is a clean exit.
        if !session.data_channel().is_session_ended() {
            error!("cannot perform start session: {e}");
            bail!("session failed: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<PluginArgs> {
        let mut argv = vec!["session-manager-plugin"];
        argv.extend_from_slice(args);
        PluginArgs::from_cli(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn test_seven_argument_form() {
        let args = parse(&[
            r#"{"SessionId":"s","StreamUrl":"wss://x","TokenValue":"t"}"#,
            "us-west-2",
            "StartSession",
            "default",
            r#"{"Target":"i-123"}"#,
            "https://ssm.us-west-2.amazonaws.com",
            "1.2.536.0",
        ])
        .unwrap();
        assert_eq!(args.region, "us-west-2");
        assert_eq!(args.operation, "StartSession");
        assert_eq!(args.profile, "default");
        assert_eq!(args.endpoint, "https://ssm.us-west-2.amazonaws.com");
        assert_eq!(args.client_version, "1.2.536.0");
    }

    #[test]
    fn test_four_argument_form_defaults_client_version() {
        let args = parse(&[
            r#"{"SessionId":"s","StreamUrl":"wss://x","TokenValue":"t"}"#,
            "eu-central-1",
            "StartSession",
            "work",
        ])
        .unwrap();
        assert_eq!(args.operation, "StartSession");
        assert!(args.parameters.is_empty());
        assert_eq!(args.client_version, config::CLIENT_VERSION);
    }

    #[test]
    fn test_wrong_argument_counts_are_rejected() {
        assert!(parse(&["response"]).is_err());
        assert!(parse(&["response", "region"]).is_err());
        assert!(parse(&["response", "region", "StartSession"]).is_err());
        assert!(parse(&["response", "region", "StartSession", "profile", "params"]).is_err());
        assert!(parse(&[
            "response",
            "region",
            "StartSession",
            "profile",
            "params",
            "endpoint"
        ])
        .is_err());
    }

    #[test]
    fn test_no_arguments_is_rejected() {
        assert!(Cli::try_parse_from(["session-manager-plugin"]).is_err());
    }

    #[test]
    fn test_start_session_response_parses() {
        let response: StartSessionResponse = serde_json::from_str(
            r#"{"SessionId":"sess-1","StreamUrl":"wss://ssmmessages/sess-1","TokenValue":"tok"}"#,
        )
        .unwrap();
        assert_eq!(response.session_id, "sess-1");
        assert_eq!(response.stream_url, "wss://ssmmessages/sess-1");
        assert_eq!(response.token_value, "tok");
    }

    #[test]
    fn test_start_session_request_target() {
        let request: StartSessionRequest =
            serde_json::from_str(r#"{"Target":"i-0abc","DocumentName":"SSM-SessionManagerRunShell"}"#)
                .unwrap();
        assert_eq!(request.target, "i-0abc");

        let empty: StartSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.target.is_empty());
    }

    #[test]
    fn test_log_filter_mapping() {
        // Only exercises the mapping table, not the environment.
        for (level, expected) in [
            ("TRACE", "trace"),
            ("DEBUG", "debug"),
            ("INFO", "info"),
            ("WARN", "warn"),
            ("ERROR", "error"),
            ("ALWAYS", "error"),
        ] {
            std::env::set_var("LOG_LEVEL", level);
            assert_eq!(log_filter_from_env(), expected, "LOG_LEVEL={level}");
        }
        std::env::remove_var("LOG_LEVEL");
        assert_eq!(log_filter_from_env(), "warn");
    }
}
