//! Newline-delimited JSON framing used between the server and worker
//! processes.

use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::messages::Message;
use crate::utils::preview;

/// Drain `channel` into `sink`, one JSON document per line, until `done()`
/// holds and the channel is empty, or the sink fails.
pub(crate) fn write_lines<W, F>(channel: &Channel<Message>, mut sink: W, done: F, poll: Duration)
where
    W: Write,
    F: Fn() -> bool,
{
    loop {
        let msg = match channel.receive(poll) {
            Ok(msg) => msg,
            Err(_) if done() => break,
            Err(_) => continue,
        };
        let line = match msg.encode() {
            Ok(line) => line,
            Err(err) => {
                warn!(kind = msg.kind(), "failed to encode message: {err}");
                continue;
            }
        };
        if writeln!(sink, "{line}").and_then(|()| sink.flush()).is_err() {
            debug!("pipe closed by peer");
            break;
        }
    }
}

/// Decode lines from `source` onto `channel` until EOF. Undecodable lines
/// are logged and skipped.
pub(crate) fn read_lines<R: Read>(source: R, channel: &Channel<Message>) {
    for line in BufReader::new(source).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match Message::decode(&line) {
            Ok(msg) => {
                channel.send(msg);
            }
            Err(err) => warn!("dropping undecodable line {:?}: {err}", preview(&line, 120)),
        }
    }
}
