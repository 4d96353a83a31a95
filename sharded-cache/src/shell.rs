//! Interactive get/put loop over a [`CacheClient`].

use std::io::{BufRead, Write};

use anyhow::{anyhow, Result};

use crate::client::CacheClient;

const USAGE: &str = "commands: PUT/p <key> <value>, GET/g <key>, HELP/h, EXIT/e";

/// One line of shell input.
#[derive(Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Put { key: String, value: i32 },
    Get { key: String },
    Help,
    Exit,
}

impl ShellCommand {
    /// Parses a line such as `put apple 3`. Commands are case-insensitive
    /// and accept their first letter as an alias.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (cmd, parts.len()) {
            ("EXIT", _) => Ok(ShellCommand::Exit),
            ("HELP", _) => Ok(ShellCommand::Help),
            ("GET", 2) => Ok(ShellCommand::Get {
                key: parts[1].to_string(),
            }),
            ("PUT", 3) => {
                let value = parts[2]
                    .parse()
                    .map_err(|_| anyhow!("value must be a 32-bit integer, got {:?}", parts[2]))?;
                Ok(ShellCommand::Put {
                    key: parts[1].to_string(),
                    value,
                })
            }
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <value>")),
            _ => Err(anyhow!("invalid command. {USAGE}")),
        }
    }
}

/// Reads commands from `input` until EOF or `exit`, writing results to
/// `output`. Failed commands are reported and the loop continues.
pub fn run_shell<R: BufRead, W: Write>(
    client: &CacheClient,
    input: R,
    mut output: W,
) -> Result<()> {
    writeln!(output, "{USAGE}")?;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let command = match ShellCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                writeln!(output, "error: {err}")?;
                continue;
            }
        };

        match command {
            ShellCommand::Exit => break,
            ShellCommand::Help => writeln!(output, "{USAGE}")?,
            ShellCommand::Get { key } => match client.get(&key) {
                Ok(Some(value)) => writeln!(output, "{key} = {value}")?,
                Ok(None) => writeln!(output, "{key} not found")?,
                Err(err) => writeln!(output, "error: {err:#}")?,
            },
            ShellCommand::Put { key, value } => match client.put(&key, value) {
                Ok(()) => writeln!(output, "ok")?,
                Err(err) => writeln!(output, "error: {err:#}")?,
            },
        }
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;

    #[test]
    fn commands_are_case_insensitive_with_aliases() {
        assert_eq!(ShellCommand::parse("exit").unwrap(), ShellCommand::Exit);
        assert_eq!(ShellCommand::parse("E").unwrap(), ShellCommand::Exit);
        assert_eq!(ShellCommand::parse("quit").unwrap(), ShellCommand::Exit);
        assert_eq!(ShellCommand::parse("h").unwrap(), ShellCommand::Help);
        assert_eq!(
            ShellCommand::parse("g apple").unwrap(),
            ShellCommand::Get {
                key: "apple".into()
            }
        );
        assert_eq!(
            ShellCommand::parse("  PUT apple -7 ").unwrap(),
            ShellCommand::Put {
                key: "apple".into(),
                value: -7
            }
        );
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(ShellCommand::parse("").is_err());
        assert!(ShellCommand::parse("get").is_err());
        assert!(ShellCommand::parse("put k").is_err());
        assert!(ShellCommand::parse("put k 1 2").is_err());
        assert!(ShellCommand::parse("put k banana").is_err());
        assert!(ShellCommand::parse("put k 99999999999").is_err());
        assert!(ShellCommand::parse("delete k").is_err());
    }

    #[test]
    fn shell_reports_errors_and_keeps_going() {
        // nothing listens here, so every request fails
        let dead = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let client = CacheClient::new(dead, Duration::from_millis(500));
        let input = b"bogus\nget k\nexit\nget never\n";
        let mut output = Vec::new();

        run_shell(&client, &input[..], &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("error: invalid command"));
        assert!(lines[2].starts_with("error: failed to connect"));
    }
}
