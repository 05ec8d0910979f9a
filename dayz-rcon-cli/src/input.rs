use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Nothing,
    Help,
    Servers,
    Status,
    Skip { server: String, index: usize },
    Shutdown { server: String, delay: Duration },
    Command { server: String, text: String },
}

/// Parses one line typed into the shell. The server name may be left out when only one server
/// is managed.
pub fn parse(line: &str, servers: &[&str]) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Nothing);
    }

    if let Some(builtin) = line.strip_prefix('!') {
        let mut words = builtin.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        return match name {
            "help" => Ok(Input::Help),
            "servers" => Ok(Input::Servers),
            "status" => Ok(Input::Status),
            "skip" => {
                let (server, rest) = pick_server(&args, servers)?;
                match rest {
                    [index] => match index.parse() {
                        Ok(index) => Ok(Input::Skip { server, index }),
                        Err(_) => Err(format!("Not a schedule number: {}", index)),
                    },
                    _ => Err("Usage: !skip <SERVER> <INDEX>".to_string()),
                }
            }
            "shutdown" => {
                let (server, rest) = pick_server(&args, servers)?;
                let seconds = match rest {
                    [] => 0,
                    [seconds] => seconds
                        .parse()
                        .map_err(|_| format!("Not a number of seconds: {}", seconds))?,
                    _ => return Err("Usage: !shutdown <SERVER> [SECONDS]".to_string()),
                };
                Ok(Input::Shutdown {
                    server,
                    delay: Duration::from_secs(seconds),
                })
            }
            other => Err(format!("Unknown builtin: !{}", other)),
        };
    }

    match line.split_once(char::is_whitespace) {
        Some((first, rest)) if servers.contains(&first) => Ok(Input::Command {
            server: first.to_string(),
            text: rest.trim().to_string(),
        }),
        _ => {
            let server = only_server(servers)?;
            Ok(Input::Command {
                server,
                text: line.to_string(),
            })
        }
    }
}

fn pick_server<'a, 'b>(
    args: &'a [&'b str],
    servers: &[&str],
) -> Result<(String, &'a [&'b str]), String> {
    match args.split_first() {
        Some((first, rest)) if servers.contains(first) => Ok((first.to_string(), rest)),
        _ => Ok((only_server(servers)?, args)),
    }
}

fn only_server(servers: &[&str]) -> Result<String, String> {
    match servers {
        [only] => Ok(only.to_string()),
        _ => Err(format!(
            "Which server? Start the line with one of: {}",
            servers.join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: &[&str] = &["main"];
    const TWO: &[&str] = &["main", "test"];

    fn command(server: &str, text: &str) -> Input {
        Input::Command {
            server: server.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn commands_with_and_without_server() {
        assert_eq!(parse("players", ONE), Ok(command("main", "players")));
        assert_eq!(
            parse("test say -1 hello there", TWO),
            Ok(command("test", "say -1 hello there"))
        );
        assert_eq!(parse("  main   players ", TWO), Ok(command("main", "players")));
        assert!(parse("players", TWO).is_err());
        assert_eq!(parse("   ", TWO), Ok(Input::Nothing));
    }

    #[test]
    fn builtins() {
        assert_eq!(parse("!help", TWO), Ok(Input::Help));
        assert_eq!(parse("!status", TWO), Ok(Input::Status));
        assert_eq!(parse("!servers", TWO), Ok(Input::Servers));
        assert_eq!(
            parse("!skip test 2", TWO),
            Ok(Input::Skip {
                server: "test".to_string(),
                index: 2
            })
        );
        assert_eq!(
            parse("!skip 0", ONE),
            Ok(Input::Skip {
                server: "main".to_string(),
                index: 0
            })
        );
        assert!(parse("!skip test", TWO).is_err());
        assert!(parse("!skip test two", TWO).is_err());
        assert!(parse("!teleport", TWO).is_err());
    }

    #[test]
    fn shutdown_delay_defaults_to_now() {
        assert_eq!(
            parse("!shutdown main", TWO),
            Ok(Input::Shutdown {
                server: "main".to_string(),
                delay: Duration::ZERO
            })
        );
        assert_eq!(
            parse("!shutdown 600", ONE),
            Ok(Input::Shutdown {
                server: "main".to_string(),
                delay: Duration::from_secs(600)
            })
        );
        assert!(parse("!shutdown 600", TWO).is_err());
    }
}
