use tokio::sync::mpsc;

/// Something a server (or the session managing it) wants the outside world to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A global or side chat line, without the channel prefix.
    ChatLine(String),
    /// Any non-empty message the server sent, verbatim.
    LogLine(String),
    PlayerConnected(String),
    PlayerDisconnected(String),
    /// Produced by the session itself: keep alive failures, shutdown progress and so on.
    Notice(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub server: String,
    pub event: Event,
}

/// Fire-and-forget delivery of events for one server.
#[derive(Debug, Clone)]
pub struct EventSink {
    server: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl EventSink {
    pub fn new(server: &str, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        EventSink {
            server: server.to_string(),
            tx,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn emit(&self, event: Event) {
        // Nobody listening is fine
        let _ = self.tx.send(ServerEvent {
            server: self.server.clone(),
            event,
        });
    }

    pub fn notice<S: Into<String>>(&self, text: S) {
        self.emit(Event::Notice(text.into()));
    }
}

/// Picks out the server messages that deserve more than a log line.
pub fn classify(message: &str) -> Option<Event> {
    let words: Vec<&str> = message.split_whitespace().collect();

    // Player #3 Some Name disconnected
    if words.first() == Some(&"Player") && words.last() == Some(&"disconnected") && words.len() > 3
    {
        return Some(Event::PlayerDisconnected(
            words[2..words.len() - 1].join(" "),
        ));
    }

    // Verified GUID (abcdef) of player #3 Some Name
    if message.starts_with("Verified GUID ") && words.get(3..5) == Some(&["of", "player"][..]) {
        if words.len() > 6 {
            return Some(Event::PlayerConnected(words[6..].join(" ")));
        }
        return None;
    }

    // (Global) Some Name: hello
    if message.starts_with("(Global)") || message.starts_with("(Side)") {
        if let Some((_, content)) = message.split_once(' ') {
            if content.contains(':') {
                return Some(Event::ChatLine(content.to_string()));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_notice() {
        assert_eq!(
            classify("Player #4 John Doe disconnected"),
            Some(Event::PlayerDisconnected("John Doe".to_string()))
        );
    }

    #[test]
    fn verified_connect_notice() {
        assert_eq!(
            classify("Verified GUID (0123456789abcdef) of player #0 Survivor"),
            Some(Event::PlayerConnected("Survivor".to_string()))
        );
    }

    #[test]
    fn global_and_side_chat() {
        assert_eq!(
            classify("(Global) Survivor: anyone near Cherno?"),
            Some(Event::ChatLine("Survivor: anyone near Cherno?".to_string()))
        );
        assert_eq!(
            classify("(Side) Bandit: :)"),
            Some(Event::ChatLine("Bandit: :)".to_string()))
        );
    }

    #[test]
    fn other_lines_are_plain_log() {
        assert_eq!(classify("RCon admin #0 (127.0.0.1:2306) logged in"), None);
        assert_eq!(classify("Player #1 Survivor (127.0.0.1:2304) connected"), None);
        assert_eq!(classify("(Direct) Survivor: psst"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn sink_tags_events_with_server() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("main", tx);
        sink.notice("keep alive");
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent {
                server: "main".to_string(),
                event: Event::Notice("keep alive".to_string()),
            }
        );
    }
}
