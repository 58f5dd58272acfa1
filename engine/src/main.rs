use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use flyboard_core::{
    resolve_state_dir, ChatConfig, LogStreamConfig, SettingsStore, DEFAULT_HOST,
    DEFAULT_MCP_COMMAND, DEFAULT_PORT, DEFAULT_TAIL_LINES,
};
use flyboard_observability::{
    emit_event, init_process_logging, logs_dir_from_state_dir, ObservabilityEvent,
};
use flyboard_runtime::{CallOptions, McpClient, McpCommand, ToolInvoker};
use flyboard_server::{serve, AppState};
use tracing::info;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "flyboard")]
#[command(about = "Dashboard backend for Fly.io apps, driven by the flyctl MCP server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve {
        #[arg(long, alias = "host", env = "FLYBOARD_HOST", default_value = DEFAULT_HOST)]
        hostname: String,
        #[arg(long, env = "FLYBOARD_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long, env = "FLYBOARD_MCP_COMMAND", default_value = DEFAULT_MCP_COMMAND)]
        mcp_command: String,
        #[arg(long, env = "FLYBOARD_STATE_DIR")]
        state_dir: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_TAIL_LINES)]
        log_lines: usize,
        /// Give up on a log stream after this many attempts. Unbounded when unset.
        #[arg(long)]
        max_log_attempts: Option<u32>,
    },
    /// Print the tool catalog exposed by the MCP server.
    Tools {
        #[arg(long, env = "FLYBOARD_MCP_COMMAND", default_value = DEFAULT_MCP_COMMAND)]
        mcp_command: String,
    },
    /// Invoke one tool and print its decoded result.
    Tool {
        name: String,
        /// Arguments as JSON, `@path` to read a file, or `-` for stdin.
        #[arg(long, default_value = "{}")]
        json: String,
        #[arg(long, env = "FLYBOARD_MCP_COMMAND", default_value = DEFAULT_MCP_COMMAND)]
        mcp_command: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            mcp_command,
            state_dir,
            log_lines,
            max_log_attempts,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = logs_dir_from_state_dir(&state_dir);
            let (_log_guard, log_info) = init_process_logging(&logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("server logging initialized: {:?}", log_info);

            let addr = resolve_addr(&hostname, port).await?;
            log_startup_paths(&state_dir, &addr);

            let client = connect(&mcp_command).await?;
            let settings = SettingsStore::load(&state_dir).await;
            let log_stream = LogStreamConfig {
                max_attempts: max_log_attempts,
                ..LogStreamConfig::default()
            };
            let state = AppState::new(
                Arc::new(client.clone()),
                settings,
                ChatConfig::default(),
                log_stream,
                log_lines,
            );

            let served = serve(addr, state).await;
            client.shutdown().await;
            emit_event(
                tracing::Level::INFO,
                ObservabilityEvent {
                    event: "mcp.session.closed",
                    component: "engine.main",
                    status: Some(if served.is_ok() { "ok" } else { "failed" }),
                    ..Default::default()
                },
            );
            served?;
        }
        Command::Tools { mcp_command } => {
            let client = connect(&mcp_command).await?;
            let listed = client.list_tools().await;
            client.shutdown().await;
            let tools = listed.context("failed to list tools")?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
        Command::Tool {
            name,
            json,
            mcp_command,
        } => {
            let args = read_tool_json(&json)?;
            if !args.is_object() {
                anyhow::bail!("tool arguments must be a JSON object");
            }
            let client = connect(&mcp_command).await?;
            let called = client.call_tool(&name, args, CallOptions::default()).await;
            client.shutdown().await;
            let output = called.with_context(|| format!("tool `{name}` failed"))?;
            println!("{}", serde_json::to_string_pretty(&output.into_value())?);
        }
    }

    Ok(())
}

async fn connect(command_line: &str) -> anyhow::Result<McpClient> {
    let command = McpCommand::parse(command_line).context("invalid MCP server command")?;
    let client = McpClient::spawn(&command)
        .await
        .with_context(|| format!("failed to start MCP server `{}`", command.display()))?;
    emit_event(
        tracing::Level::INFO,
        ObservabilityEvent {
            event: "mcp.session.connected",
            component: "engine.main",
            status: Some("ok"),
            detail: Some(&command.display()),
            ..Default::default()
        },
    );
    Ok(client)
}

async fn resolve_addr(hostname: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((hostname, port))
        .await
        .with_context(|| format!("invalid hostname `{hostname}`"))?
        .next()
        .with_context(|| format!("hostname `{hostname}` resolved to no address"))
}

fn read_tool_json(input: &str) -> anyhow::Result<serde_json::Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "starting flyboard: exe={} cwd={} state_dir={} addr={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        addr
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serve_defaults_point_at_flyctl() {
        let cli = Cli::try_parse_from(["flyboard", "serve"]).expect("parse");
        let Command::Serve {
            hostname,
            port,
            mcp_command,
            log_lines,
            max_log_attempts,
            ..
        } = cli.command
        else {
            panic!("expected serve");
        };
        // env overrides would leak into this check when set on the host
        if std::env::var_os("FLYBOARD_HOST").is_none() {
            assert_eq!(hostname, "127.0.0.1");
        }
        if std::env::var_os("FLYBOARD_PORT").is_none() {
            assert_eq!(port, 3000);
        }
        if std::env::var_os("FLYBOARD_MCP_COMMAND").is_none() {
            assert_eq!(mcp_command, "flyctl mcp server");
        }
        assert_eq!(log_lines, 100);
        assert_eq!(max_log_attempts, None);
    }

    #[test]
    fn host_alias_and_tool_args_parse() {
        let cli = Cli::try_parse_from(["flyboard", "serve", "--host", "0.0.0.0", "--port", "8080"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::Serve { ref hostname, port: 8080, .. } if hostname == "0.0.0.0"
        ));

        let cli = Cli::try_parse_from(["flyboard", "tool", "fly-status", "--json", r#"{"app":"web"}"#])
            .expect("parse");
        let Command::Tool { name, json, .. } = cli.command else {
            panic!("expected tool");
        };
        assert_eq!(name, "fly-status");
        assert_eq!(read_tool_json(&json).expect("json"), json!({"app": "web"}));
    }

    #[tokio::test]
    async fn hostnames_resolve_like_ip_literals() {
        let addr = resolve_addr("127.0.0.1", 3000).await.expect("ip literal");
        assert_eq!(addr, "127.0.0.1:3000".parse::<SocketAddr>().expect("addr"));
        let addr = resolve_addr("localhost", 8080).await.expect("localhost");
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn read_tool_json_loads_files() {
        let dir = std::env::temp_dir().join(format!("flyboard-args-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("args.json");
        fs::write(&path, r#"{"app":"api","region":"ord"}"#).expect("write");

        let value = read_tool_json(&format!("@{}", path.display())).expect("json");
        assert_eq!(value["region"], "ord");
        assert!(read_tool_json("@/definitely/missing.json").is_err());
        assert!(read_tool_json("{broken").is_err());

        let _ = fs::remove_dir_all(dir);
    }
}
