//! TCP listener and per-connection thread spawning.
//!
//! One thread per connection; sessions operate directly on the shared
//! repository, so contention is per queue, not global.

pub mod command;
pub mod dispatch;
pub mod session;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::repository::Repository;
use crate::server::session::Session;

pub use dispatch::{CommandError, Flow};
pub use session::Reservation;

/// Poll interval for the shutdown flag while the listener is idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    repo: Arc<Repository>,
    idle_timeout: Option<Duration>,
}

impl Server {
    /// Initialize the repository from the data directory and bind the
    /// listener.
    pub fn bind(config: &Config) -> crate::Result<Self> {
        let repo = Arc::new(Repository::initialize(&config.data_dir)?);
        let listener = TcpListener::bind(&config.listen_addr)?;
        Ok(Self {
            listener,
            repo,
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn repository(&self) -> Arc<Repository> {
        Arc::clone(&self.repo)
    }

    /// Accept connections until SIGTERM/SIGINT.
    pub fn run(self) -> crate::Result<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));
        self.run_until(shutdown)
    }

    /// Accept connections until the shutdown flag is raised, then close all
    /// queues.
    pub fn run_until(self, shutdown: Arc<AtomicBool>) -> crate::Result<()> {
        tracing::info!("listening on {}", self.listener.local_addr()?);
        self.listener.set_nonblocking(true)?;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown signal received");
                break;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!("accepted connection from {}", peer);
                    let repo = Arc::clone(&self.repo);
                    let idle_timeout = self.idle_timeout;
                    std::thread::spawn(move || handle_connection(stream, repo, idle_timeout));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    tracing::error!("accept error: {}", err);
                }
            }
        }

        self.repo.close_all_queues();
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, repo: Arc<Repository>, idle_timeout: Option<Duration>) {
    let _ = stream.set_nonblocking(false);
    if let Err(err) = stream.set_read_timeout(idle_timeout) {
        tracing::error!("failed to set read deadline: {}", err);
        return;
    }

    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(err) => {
            tracing::error!("failed to clone stream: {}", err);
            return;
        }
    };

    Session::new(reader, stream, repo).run();
}
