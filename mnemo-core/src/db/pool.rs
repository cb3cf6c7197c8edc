//! Bounded-wait pool of read-only connections.

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::ops::Deref;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub(crate) struct ReaderPool {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
    wait: Duration,
    size: usize,
}

impl ReaderPool {
    pub(crate) fn new(connections: Vec<Connection>, wait: Duration) -> Self {
        let size = connections.len();
        Self {
            idle: Mutex::new(connections),
            available: Condvar::new(),
            wait,
            size,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Take a connection, waiting at most the configured bound.
    pub(crate) fn acquire(&self) -> Result<PooledConnection<'_>> {
        let deadline = Instant::now() + self.wait;
        let mut idle = self.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if self.available.wait_until(&mut idle, deadline).timed_out() && idle.is_empty() {
                return Err(Error::Busy(format!(
                    "no reader connection available within {}ms",
                    self.wait.as_millis()
                )));
            }
        }
    }

    fn release(&self, conn: Connection) {
        self.idle.lock().push(conn);
        self.available.notify_one();
    }
}

/// Reader connection that returns itself to the pool on drop.
pub(crate) struct PooledConnection<'a> {
    pool: &'a ReaderPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
