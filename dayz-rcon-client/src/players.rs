/// One row of the `players` command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: u32,
    pub address: String,
    pub ping: u32,
    pub guid: String,
    pub name: String,
}

/// Parses the table printed by the `players` command:
///
/// ```text
/// Players on server:
/// [#] [IP Address]:[Port] [Ping] [GUID] [Name]
/// --------------------------------------------------
/// 2 127.0.0.1:2304 0 1234(OK) Survivor2
/// (1 players in total)
/// ```
///
/// Rows that do not start with a numeric id are skipped.
pub fn parse_players(output: &str) -> Vec<Player> {
    output.lines().filter_map(parse_row).collect()
}

fn parse_row(line: &str) -> Option<Player> {
    let mut fields = line.split_whitespace();
    let id = fields.next()?.parse().ok()?;
    let address = fields.next()?.to_string();
    let ping = fields.next()?.parse().ok()?;
    let guid = fields.next()?.to_string();

    let name = fields.collect::<Vec<_>>().join(" ");
    let name = name.strip_suffix(" (Lobby)").unwrap_or(&name).to_string();
    if name.is_empty() {
        return None;
    }

    Some(Player {
        id,
        address,
        ping,
        guid,
        name,
    })
}

/// Reads the `(N players in total)` footer.
pub fn player_total(output: &str) -> Option<usize> {
    output.lines().rev().find_map(|line| {
        line.trim()
            .strip_prefix('(')?
            .strip_suffix(" players in total)")?
            .parse()
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
Players on server:
[#] [IP Address]:[Port] [Ping] [GUID] [Name]
--------------------------------------------------
2 127.0.0.1:2304 0 1234(OK) Survivor2
4 127.0.0.2:2304 32 5678(OK) John Doe (Lobby)
(2 players in total)";

    #[test]
    fn parses_rows() {
        let players = parse_players(OUTPUT);
        assert_eq!(
            players,
            vec![
                Player {
                    id: 2,
                    address: "127.0.0.1:2304".to_string(),
                    ping: 0,
                    guid: "1234(OK)".to_string(),
                    name: "Survivor2".to_string(),
                },
                Player {
                    id: 4,
                    address: "127.0.0.2:2304".to_string(),
                    ping: 32,
                    guid: "5678(OK)".to_string(),
                    name: "John Doe".to_string(),
                },
            ]
        );
        assert_eq!(player_total(OUTPUT), Some(2));
    }

    #[test]
    fn empty_server() {
        let output = "\
Players on server:
[#] [IP Address]:[Port] [Ping] [GUID] [Name]
--------------------------------------------------
(0 players in total)";
        assert!(parse_players(output).is_empty());
        assert_eq!(player_total(output), Some(0));
    }
}
