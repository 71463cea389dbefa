//! Connects listener events to the job registry.
//!
//! - A binary request carries a JSON [`CommandRequest`] and is submitted as a job.
//! - A WebSocket text message `reqCallback:<id>` is answered with the job status as JSON.
//!
//! Everything else is logged and ignored.

use crate::connection::{Connection, Handler, Kind, Message};
use crate::jobs::JobRegistry;
use loopgate_internal::request::CommandRequest;
use std::sync::Arc;

/// Prefix of a status query, matched case-insensitively.
pub const QUERY_PREFIX: &str = "reqCallback:";

pub struct Bridge {
    registry: Arc<JobRegistry>,
}

impl Bridge {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Bridge { registry }
    }

    /// The JSON reply to a text message, or `None` if it is not a status query.
    pub fn answer(&self, text: &str) -> Option<String> {
        let callback_id = strip_prefix_ignore_case(text, QUERY_PREFIX)?.trim();
        let response = self.registry.query(callback_id);
        match response.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                logwise::error_sync!(
                    "Could not encode status for {callback_id}: {e}",
                    callback_id = callback_id,
                    e = logwise::privacy::LogIt(&e)
                );
                None
            }
        }
    }

    fn submit(&self, payload: &[u8]) -> bool {
        match CommandRequest::from_json(payload) {
            Ok(request) => {
                self.registry.submit(request);
                true
            }
            Err(e) => {
                logwise::warn_sync!(
                    "Rejecting malformed command request: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
                false
            }
        }
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

impl Handler for Bridge {
    fn on_connect(&self, connection: &Arc<Connection>) {
        let kind = connection.kind();
        logwise::info_sync!(
            "Connection {id} from port {port} opened as {kind}",
            id = connection.id(),
            port = connection.port(),
            kind = logwise::privacy::LogIt(&kind)
        );
    }

    fn on_message(&self, connection: &Arc<Connection>, message: Message) -> bool {
        match (connection.kind(), message) {
            (Kind::Binary, Message::Binary(payload)) => self.submit(&payload),
            (Kind::WebSocket, Message::Text(text)) => {
                let Some(reply) = self.answer(&text) else {
                    logwise::warn_sync!(
                        "Ignoring text on connection {id}: {text}",
                        id = connection.id(),
                        text = text.as_str()
                    );
                    return false;
                };
                if let Err(e) = connection.send_text(&reply) {
                    logwise::warn_sync!(
                        "Could not answer on connection {id}: {e}",
                        id = connection.id(),
                        e = logwise::privacy::LogIt(&e)
                    );
                    return false;
                }
                true
            }
            (kind, _) => {
                logwise::warn_sync!(
                    "Ignoring unexpected message on {kind} connection {id}",
                    kind = logwise::privacy::LogIt(&kind),
                    id = connection.id()
                );
                false
            }
        }
    }

    fn on_closed(&self, connection: &Arc<Connection>) {
        logwise::info_sync!("Connection {id} closed", id = connection.id());
    }
}
