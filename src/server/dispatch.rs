//! Verb dispatch, handlers, and response writing.
//!
//! Each command produces exactly one response (a single line, or a
//! `VALUE`/`END` pair). Handler errors are written back with their protocol
//! prefix and the session stays alive; only I/O errors on the client stream
//! terminate it.

use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::queue::{PersistentQueue, QueueError};
use crate::server::command::{parse_get_command, Command};
use crate::server::session::Session;

/// Error taxonomy mapped to protocol prefixes.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("ERROR Unknown command")]
    UnknownCommand,

    #[error("ERROR Invalid command")]
    InvalidCommand,

    #[error("CLIENT_ERROR {0}")]
    Client(String),

    #[error("SERVER_ERROR {0}")]
    Server(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether the session loop keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

impl<R: Read, W: Write> Session<R, W> {
    /// Serve the connection until EOF, deadline expiry, I/O failure, or
    /// QUIT. Tears the session down (including reservation rollback) on
    /// every exit path.
    pub fn run(mut self) {
        loop {
            let line = match self.read_command_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!("client read error: {}", err);
                    break;
                }
            };
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            match self.dispatch(line) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(CommandError::Io(err)) => {
                    tracing::debug!("client write error: {}", err);
                    break;
                }
                Err(err) => {
                    if self.send_error(&err).is_err() {
                        break;
                    }
                    continue;
                }
            }

            if self.writer.flush().is_err() {
                break;
            }
        }
        self.finish();
    }

    /// Parse one command line and invoke its handler.
    pub(crate) fn dispatch(&mut self, line: &str) -> Result<Flow, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            return Err(CommandError::UnknownCommand);
        };
        let verb = first.to_ascii_lowercase();

        match verb.as_str() {
            "get" | "gets" => {
                let arg = tokens.get(1).ok_or(CommandError::InvalidCommand)?;
                let cmd = parse_get_command(&verb, arg);
                self.handle_get(&cmd)?;
                Ok(Flow::Continue)
            }
            "set" => {
                self.handle_set(&tokens)?;
                Ok(Flow::Continue)
            }
            "delete" => {
                self.handle_delete(&tokens)?;
                Ok(Flow::Continue)
            }
            "flush" => {
                self.handle_flush(&tokens)?;
                Ok(Flow::Continue)
            }
            "flush_all" => {
                self.handle_flush_all()?;
                Ok(Flow::Continue)
            }
            "stats" => {
                self.handle_stats()?;
                Ok(Flow::Continue)
            }
            "version" => {
                self.handle_version()?;
                Ok(Flow::Continue)
            }
            "quit" => Ok(Flow::Quit),
            _ => Err(CommandError::UnknownCommand),
        }
    }

    pub(crate) fn send_error(&mut self, err: &CommandError) -> std::io::Result<()> {
        write!(self.writer, "{err}\r\n")?;
        self.writer.flush()
    }

    fn handle_get(&mut self, cmd: &Command) -> Result<(), CommandError> {
        match cmd.sub_command.as_str() {
            "" | "open" => self.get_item(cmd)?,
            "close" => self.get_close(cmd)?,
            "close/open" => {
                self.get_close(cmd)?;
                self.get_item(cmd)?;
            }
            "abort" => self.get_abort(cmd)?,
            "peek" => self.get_peek(cmd)?,
            _ => return Err(CommandError::InvalidCommand),
        }
        self.writer.write_all(b"END\r\n")?;
        Ok(())
    }

    /// Destructive dequeue; with an `open` sub-command the item is held as
    /// this session's reservation instead of being forgotten.
    fn get_item(&mut self, cmd: &Command) -> Result<(), CommandError> {
        if self.is_holding() {
            return Err(CommandError::Client("Close current item first".to_string()));
        }

        let queue = self.resolve_queue(&cmd.queue_name)?;
        let item = match queue.dequeue() {
            Ok(item) => Some(item),
            Err(QueueError::Empty) => None,
            Err(err) => return Err(CommandError::Server(err.to_string())),
        };

        if let Some(item) = item {
            if !item.is_empty() {
                self.write_value(&cmd.queue_name, &item.value)?;
                if cmd.sub_command.contains("open") {
                    queue.add_open_transactions(1);
                    self.set_reservation(&cmd.queue_name, item);
                }
            }
        }
        self.repo.stats.cmd_get.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Acknowledge the held item. A close with nothing held is a no-op.
    fn get_close(&mut self, cmd: &Command) -> Result<(), CommandError> {
        let queue = self.resolve_queue(&cmd.queue_name)?;
        if self.take_reservation().is_some() {
            queue.add_open_transactions(-1);
        }
        Ok(())
    }

    /// Return the held item to the head of its queue.
    fn get_abort(&mut self, cmd: &Command) -> Result<(), CommandError> {
        if !self.is_holding() {
            return Ok(());
        }
        let queue = self.resolve_queue(&cmd.queue_name)?;
        let Some(reservation) = self.reservation.as_ref() else {
            return Ok(());
        };
        queue
            .prepend(&reservation.item)
            .map_err(|err| CommandError::Server(err.to_string()))?;
        self.take_reservation();
        queue.add_open_transactions(-1);
        Ok(())
    }

    fn get_peek(&mut self, cmd: &Command) -> Result<(), CommandError> {
        let queue = self.resolve_queue(&cmd.queue_name)?;
        let item = match queue.peek() {
            Ok(item) => Some(item),
            Err(QueueError::Empty) => None,
            Err(err) => return Err(CommandError::Server(err.to_string())),
        };

        if let Some(item) = item {
            if !item.is_empty() {
                self.write_value(&cmd.queue_name, &item.value)?;
            }
        }
        self.repo.stats.cmd_get.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// `set <queue> <flags> <expiry> <bytes>` followed by the payload.
    /// Flags and expiry are accepted syntactically and ignored.
    fn handle_set(&mut self, tokens: &[&str]) -> Result<(), CommandError> {
        if tokens.len() < 5 {
            return Err(CommandError::Client("bad command line format".to_string()));
        }
        let queue_name = tokens[1];
        let len: usize = tokens[4]
            .parse()
            .map_err(|_| CommandError::Client("bad command line format".to_string()))?;

        let payload = self.read_payload(len)?;
        let (value, terminator) = payload.split_at(len);
        if terminator != b"\r\n" {
            return Err(CommandError::Client("bad data chunk".to_string()));
        }

        let queue = self.resolve_queue(queue_name)?;
        queue
            .enqueue(value)
            .map_err(|err| CommandError::Server(err.to_string()))?;
        self.repo.stats.cmd_set.fetch_add(1, Ordering::SeqCst);
        self.writer.write_all(b"STORED\r\n")?;
        Ok(())
    }

    fn handle_delete(&mut self, tokens: &[&str]) -> Result<(), CommandError> {
        let name = tokens.get(1).ok_or(CommandError::InvalidCommand)?;
        self.repo.delete_queue(name).map_err(|err| {
            tracing::error!("can't delete queue {}: {}", name, err);
            CommandError::Server(err.to_string())
        })?;
        self.writer.write_all(b"DELETED\r\n")?;
        Ok(())
    }

    fn handle_flush(&mut self, tokens: &[&str]) -> Result<(), CommandError> {
        let name = tokens.get(1).ok_or(CommandError::InvalidCommand)?;
        self.repo.flush_queue(name).map_err(|err| {
            tracing::error!("can't flush queue {}: {}", name, err);
            CommandError::Server(err.to_string())
        })?;
        self.writer.write_all(b"END\r\n")?;
        Ok(())
    }

    fn handle_flush_all(&mut self) -> Result<(), CommandError> {
        self.repo
            .flush_all_queues()
            .map_err(|err| CommandError::Server(err.to_string()))?;
        self.writer.write_all(b"Flushed all queues.\r\nEND\r\n")?;
        Ok(())
    }

    fn handle_stats(&mut self) -> Result<(), CommandError> {
        let stats = &self.repo.stats;
        write!(self.writer, "STAT version {}\r\n", stats.version())?;
        write!(self.writer, "STAT uptime {}\r\n", stats.uptime_secs())?;
        write!(
            self.writer,
            "STAT curr_connections {}\r\n",
            stats.current_connections.load(Ordering::SeqCst)
        )?;
        write!(
            self.writer,
            "STAT total_connections {}\r\n",
            stats.total_connections.load(Ordering::SeqCst)
        )?;
        write!(
            self.writer,
            "STAT cmd_get {}\r\n",
            stats.cmd_get.load(Ordering::SeqCst)
        )?;
        write!(
            self.writer,
            "STAT cmd_set {}\r\n",
            stats.cmd_set.load(Ordering::SeqCst)
        )?;
        for queue in self.repo.queue_stats() {
            write!(
                self.writer,
                "STAT queue_{}_items {}\r\n",
                queue.name, queue.items
            )?;
            write!(
                self.writer,
                "STAT queue_{}_open_transactions {}\r\n",
                queue.name, queue.open_transactions
            )?;
        }
        self.writer.write_all(b"END\r\n")?;
        Ok(())
    }

    fn handle_version(&mut self) -> Result<(), CommandError> {
        write!(self.writer, "VERSION {}\r\n", self.repo.stats.version())?;
        Ok(())
    }

    fn write_value(&mut self, queue_name: &str, value: &[u8]) -> std::io::Result<()> {
        write!(self.writer, "VALUE {} 0 {}\r\n", queue_name, value.len())?;
        self.writer.write_all(value)?;
        self.writer.write_all(b"\r\n")
    }

    fn resolve_queue(&self, name: &str) -> Result<Arc<PersistentQueue>, CommandError> {
        self.repo.get_queue(name).map_err(|err| {
            tracing::error!("can't get queue {}: {}", name, err);
            CommandError::Server(err.to_string())
        })
    }
}
