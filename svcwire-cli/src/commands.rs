//! Command execution.

use crate::Commands;
use colored::Colorize;
use sha2::{Digest, Sha256};
use svcwire_client::Client;
use svcwire_protocol::message::Reload;
use svcwire_protocol::Value;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            let rtt = client.ping().await?;
            Ok(format!("{} ({:.1} ms)", "PONG".green(), rtt.as_secs_f64() * 1000.0))
        }

        Commands::Call { command, params } => {
            let params = params
                .iter()
                .map(|p| parse_param(p))
                .collect::<Result<Vec<_>, _>>()?;
            let result = client.call(&command, params).await?;
            Ok(format_json(&result))
        }

        Commands::Listeners { name } => {
            let listeners = client.listener_infos(&name).await?;
            if listeners.is_empty() {
                return Ok(format!("No listeners for {}", name).yellow().to_string());
            }
            let mut output = format!("{}", format!("Listeners for {}", name.cyan()).bold());
            for listener in listeners {
                output.push_str(&format!("\n  {}  {}", listener.key.dimmed(), listener.info));
            }
            Ok(output)
        }

        Commands::Emit { name, data, all } => {
            let data = parse_json_arg(&data)?;
            let count = client
                .emit(&name, data, |info, data| all || info_matches(info, data))
                .await?;
            if count == 0 {
                Ok("No matching listeners".yellow().to_string())
            } else {
                Ok(format!("{} {} to {} listener(s)", "Emitted".green(), name.cyan(), count))
            }
        }

        Commands::Upload {
            local,
            remote,
            chunk_size,
        } => {
            let result = client.upload_file_chunked(&local, &remote, chunk_size).await?;
            let size = result.get("size").and_then(Value::as_u64).unwrap_or(0);
            Ok(format!(
                "{} {} ({})",
                "Uploaded".green(),
                remote.cyan(),
                format_bytes(size)
            ))
        }

        // Streaming and local commands are handled in main.rs
        Commands::Listen { .. } | Commands::WatchReloads | Commands::HashToken { .. } => {
            unreachable!()
        }
    }
}

/// A listener matches when every field of its info object is equal in the
/// data. A listener without info matches everything.
pub fn info_matches(info: &Value, data: &Value) -> bool {
    match info.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| data.get(k) == Some(v)),
        None => info.is_null(),
    }
}

/// Hex SHA-256 of a token, as stored in the server's token list.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn format_reload(reload: &Reload) -> String {
    if reload.changed_files.is_empty() {
        "reload".yellow().to_string()
    } else {
        format!("{}: {}", "reload".yellow(), reload.changed_files.join(", "))
    }
}

/// Formats bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
pub fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Like [`parse_json_arg`], but a bare word is taken as a string.
fn parse_param(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if arg.starts_with('@') {
        return parse_json_arg(arg);
    }
    Ok(serde_json::from_str(arg).unwrap_or_else(|_| Value::from(arg)))
}

/// Formats a value for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_matches() {
        let data = Value::object([("dept", "dev"), ("user", "ann")]);
        assert!(info_matches(&Value::Null, &data));
        assert!(info_matches(&Value::object([("dept", "dev")]), &data));
        assert!(!info_matches(&Value::object([("dept", "ops")]), &data));
        assert!(!info_matches(&Value::from("dev"), &data));
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("42").unwrap(), Value::from(42));
        assert_eq!(parse_param("hello").unwrap(), Value::from("hello"));
        assert_eq!(parse_param("\"quoted\"").unwrap(), Value::from("quoted"));
    }

    #[test]
    fn test_hash_token() {
        assert_eq!(
            hash_token("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }
}
