use std::{
    io::{self, ErrorKind::WouldBlock},
    net::Shutdown,
    path::Path,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use mio::{net::UnixListener, Events, Interest, Poll, Token};
use slab::Slab;

use crate::{
    distributed::comm_buffers::{Connection, TransportState},
    errors::{Error, Result},
    protocol::Message,
};

/// Opaque handle of a connection, only valid for the event loop that handed it out. Slots are
/// reused after a connection has been closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    #[cfg(test)]
    pub(crate) fn from_raw(key: usize) -> Self {
        Self(key)
    }
}

/// Timeouts and buffer sizes of the event loop
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Maximum time without any socket activity at all
    pub idle_timeout: Duration,
    /// Maximum time a partially received message may stall
    pub read_timeout: Duration,
    /// Maximum time pending outbound bytes may stall
    pub write_timeout: Duration,
    pub read_chunk_size: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            read_chunk_size: 1500,
        }
    }
}

/// What message handlers may do with the event loop while it is running
pub trait Outbox {
    /// Queues `message` for sending on `connection`
    fn send(&mut self, connection: ConnectionId, message: &Message) -> Result<()>;

    /// Asks the event loop to finish. Queued messages are still delivered.
    fn stop(&mut self);
}

type Handler<'h> = Box<dyn FnMut(&Message, ConnectionId, &mut Control<'_>) -> Result<()> + 'h>;

/// The part of the event loop handed to message handlers
pub struct Control<'a> {
    connections: &'a mut Slab<Connection>,
    stopping: &'a mut bool,
}

impl Outbox for Control<'_> {
    fn send(&mut self, connection: ConnectionId, message: &Message) -> Result<()> {
        queue_message(self.connections, *self.stopping, connection, message)
    }

    fn stop(&mut self) {
        *self.stopping = true;
    }
}

fn queue_message(
    connections: &mut Slab<Connection>,
    stopping: bool,
    connection: ConnectionId,
    message: &Message,
) -> Result<()> {
    if stopping {
        return Err(Error::Stopped);
    }
    let connection = connections
        .get_mut(connection.0)
        .ok_or(Error::UnknownConnection)?;
    if connection.tx_buffer.is_empty() {
        // The write stall timer starts with the first pending byte
        connection.last_write = Instant::now();
    }
    connection.tx_buffer.push(&message.encode()?);
    Ok(())
}

/// Single-threaded reactor multiplexing one listening Unix socket and all accepted connections.
///
/// Completed messages are handed to the subscribed handlers, which reply through `Outbox`. The
/// event loop itself never looks into messages.
pub struct EventLoop<'h> {
    poll: Poll,
    listener: Option<UnixListener>,
    connections: Slab<Connection>,
    handlers: Vec<Handler<'h>>,
    options: LoopOptions,
    stopping: bool,
}

// Token numbering starts with '1' because of weird behaviour with Token(0) on BSDs
const LISTENER_TOKEN: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

impl<'h> EventLoop<'h> {
    pub fn new(options: LoopOptions) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            listener: None,
            connections: Slab::new(),
            handlers: Vec::new(),
            options,
            stopping: false,
        })
    }

    /// Binds a non-blocking listening socket to `path`. Accepted connections become regular
    /// connections of this event loop.
    pub fn listen<P>(&mut self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let mut listener = UnixListener::bind(path)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Registers a handler which gets called once per completed message
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&Message, ConnectionId, &mut Control<'_>) -> Result<()> + 'h,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn send(&mut self, connection: ConnectionId, message: &Message) -> Result<()> {
        queue_message(&mut self.connections, self.stopping, connection, message)
    }

    pub fn stop(&mut self) {
        self.stopping = true;
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Drives all sockets until `stop()` has been requested and every queued byte has been
    /// written. All sockets are closed on return, on success as well as on failure.
    pub fn run(&mut self) -> Result<()> {
        let out = self.run_until_drained();
        self.close_all();
        out
    }

    fn run_until_drained(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut scratch = vec![0; self.options.read_chunk_size.max(1)];
        let mut last_activity = Instant::now();

        loop {
            if self.stopping && self.is_drained() {
                debug!("All outbound buffers drained, leaving event loop");
                return Ok(());
            }

            self.update_interests()?;

            let timeout = self.poll_timeout(last_activity);
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let now = Instant::now();
            if events.is_empty() {
                self.check_stalled_connections(now)?;
                if now.duration_since(last_activity) >= self.options.idle_timeout {
                    return Err(Error::Timeout(self.options.idle_timeout));
                }
                continue;
            }
            last_activity = now;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections()?,
                    Token(token) => {
                        let key = token - FIRST_CONNECTION_TOKEN;
                        if !self.connections.contains(key) {
                            continue;
                        }
                        if self.stopping {
                            // Nothing new is taken in while draining, only hang-ups matter
                            if event.is_read_closed() {
                                debug!("Connection {} closed by peer while draining", key);
                                self.close_connection(key);
                                continue;
                            }
                        } else if event.is_readable() || event.is_read_closed() {
                            self.handle_readable(key, &mut scratch)?;
                        }
                        if event.is_writable() && self.connections.contains(key) {
                            self.flush_connection(key)?;
                        }
                    }
                }
            }

            // Replies queued by handlers go out right away, a stalled remainder waits for the
            // next writable event
            self.flush_all()?;
            self.check_stalled_connections(Instant::now())?;
        }
    }

    fn is_drained(&self) -> bool {
        self.connections
            .iter()
            .all(|(_, connection)| connection.tx_buffer.is_empty())
    }

    /// Shortest of the idle timeout and the remaining time of any connection that is in the middle
    /// of reading or writing a message
    fn poll_timeout(&self, last_activity: Instant) -> Duration {
        let now = Instant::now();
        let idle_deadline = last_activity + self.options.idle_timeout;
        self.connections
            .iter()
            .filter_map(|(_, connection)| self.stall_deadline(connection))
            .chain(std::iter::once(idle_deadline))
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(self.options.idle_timeout)
    }

    fn stall_deadline(&self, connection: &Connection) -> Option<Instant> {
        let read_deadline = (!self.stopping && !connection.assembler.is_idle())
            .then(|| connection.last_read + self.options.read_timeout);
        let write_deadline = (!connection.tx_buffer.is_empty())
            .then(|| connection.last_write + self.options.write_timeout);
        read_deadline.into_iter().chain(write_deadline).min()
    }

    fn check_stalled_connections(&self, now: Instant) -> Result<()> {
        for (key, connection) in self.connections.iter() {
            if !self.stopping
                && !connection.assembler.is_idle()
                && now.duration_since(connection.last_read) >= self.options.read_timeout
            {
                warn!("Connection {} stalled in the middle of a message", key);
                return Err(Error::Timeout(self.options.read_timeout));
            }
            if !connection.tx_buffer.is_empty()
                && now.duration_since(connection.last_write) >= self.options.write_timeout
            {
                warn!("Connection {} does not accept any more data", key);
                return Err(Error::Timeout(self.options.write_timeout));
            }
        }
        Ok(())
    }

    fn update_interests(&mut self) -> Result<()> {
        for (key, connection) in self.connections.iter_mut() {
            let wanted = connection.wanted_interest();
            if wanted != connection.interest {
                self.poll
                    .registry()
                    .reregister(&mut connection.stream, connection_token(key), wanted)?;
                connection.interest = wanted;
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) -> Result<()> {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return Ok(()),
        };

        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let entry = self.connections.vacant_entry();
                    let token = connection_token(entry.key());
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    debug!("Connection established (slot {})", entry.key());
                    entry.insert(Connection::new(stream));
                }
                Err(ref e) if e.kind() == WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle_readable(&mut self, key: usize, scratch: &mut [u8]) -> Result<()> {
        let received = self.connections[key].receive(scratch)?;
        trace!(
            "Connection {}: received {} bytes, {} messages",
            key,
            received.bytes,
            received.messages.len()
        );

        for message in &received.messages {
            self.dispatch(message, ConnectionId(key))?;
        }

        if received.eof {
            // A handler may just have stopped the loop
            if self.stopping {
                self.close_connection(key);
            } else {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, message: &Message, connection: ConnectionId) -> Result<()> {
        let mut control = Control {
            connections: &mut self.connections,
            stopping: &mut self.stopping,
        };
        for handler in self.handlers.iter_mut() {
            handler(message, connection, &mut control)?;
        }
        Ok(())
    }

    fn flush_connection(&mut self, key: usize) -> Result<()> {
        if let TransportState::Stalled = self.connections[key].flush()? {
            trace!("Connection {}: write stalled", key);
        }
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        for (_, connection) in self
            .connections
            .iter_mut()
            .filter(|(_, connection)| !connection.tx_buffer.is_empty())
        {
            connection.flush()?;
        }
        Ok(())
    }

    fn close_connection(&mut self, key: usize) {
        let mut connection = self.connections.remove(key);
        let _ = self.poll.registry().deregister(&mut connection.stream);
        let _ = connection.stream.shutdown(Shutdown::Both);
    }

    fn close_all(&mut self) {
        let keys = self
            .connections
            .iter()
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in keys {
            self.close_connection(key);
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }
}

fn connection_token(key: usize) -> Token {
    Token(key + FIRST_CONNECTION_TOKEN)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
        thread,
    };

    use tempfile::tempdir;

    use super::*;
    use crate::protocol::MessageAssembler;

    fn short_options() -> LoopOptions {
        LoopOptions {
            idle_timeout: Duration::from_secs(5),
            ..LoopOptions::default()
        }
    }

    #[test]
    fn echo_until_stopped() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("echo.sock");

        let mut received = Vec::new();
        let mut event_loop = EventLoop::new(short_options()).unwrap();
        event_loop.listen(&socket_path).unwrap();

        event_loop.subscribe(|message, connection, control| {
            received.push(message.body().to_vec());
            let reply = Message::new(message.body().to_vec()).with_header("echo", "yes");
            control.send(connection, &reply)?;
            if message.header("last").is_some() {
                control.stop();
            }
            Ok(())
        });

        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(socket_path).unwrap();
            let first = Message::new("ping").encode().unwrap();
            let last = Message::new("bye")
                .with_header("last", "1")
                .encode()
                .unwrap();
            // Both messages in one write, the second one split across two writes
            let mut bytes = first;
            bytes.extend_from_slice(&last[..5]);
            stream.write_all(&bytes).unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(&last[5..]).unwrap();

            let mut assembler = MessageAssembler::new();
            let mut replies = Vec::new();
            let mut buf = [0u8; 16];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                replies.extend(assembler.feed(&buf[..n]).unwrap());
            }
            replies
        });

        event_loop.run().unwrap();
        assert_eq!(event_loop.num_connections(), 0);
        drop(event_loop);

        assert_eq!(received, vec![b"ping".to_vec(), b"bye".to_vec()]);
        let replies = client.join().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].body(), b"ping");
        assert_eq!(replies[1].body(), b"bye");
        assert_eq!(replies[1].header("echo"), Some("yes"));
    }

    #[test]
    fn nothing_is_sent_after_stop() {
        let mut event_loop = EventLoop::new(short_options()).unwrap();
        event_loop.stop();
        assert!(matches!(
            event_loop.send(ConnectionId(0), &Message::new("x")),
            Err(Error::Stopped)
        ));
        // Nothing pending, so the loop returns right away
        event_loop.run().unwrap();
    }

    #[test]
    fn unknown_connection() {
        let mut event_loop = EventLoop::new(short_options()).unwrap();
        assert!(matches!(
            event_loop.send(ConnectionId(7), &Message::new("x")),
            Err(Error::UnknownConnection)
        ));
    }

    #[test]
    fn idle_timeout() {
        let temp_dir = tempdir().unwrap();
        let mut event_loop = EventLoop::new(LoopOptions {
            idle_timeout: Duration::from_millis(50),
            ..LoopOptions::default()
        })
        .unwrap();
        event_loop.listen(temp_dir.path().join("idle.sock")).unwrap();
        assert!(matches!(event_loop.run(), Err(Error::Timeout(_))));
    }

    #[test]
    fn peer_hang_up_is_an_error_while_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("hangup.sock");
        let mut event_loop = EventLoop::new(short_options()).unwrap();
        event_loop.listen(&socket_path).unwrap();

        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(socket_path).unwrap();
            stream.write_all(b"cmd:new-").unwrap();
        });

        assert!(matches!(event_loop.run(), Err(Error::ConnectionClosed)));
        client.join().unwrap();
    }

    #[test]
    fn message_stalled_halfway() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("stalled_read.sock");
        let read_timeout = Duration::from_millis(100);
        let mut event_loop = EventLoop::new(LoopOptions {
            idle_timeout: Duration::from_secs(10),
            read_timeout,
            ..LoopOptions::default()
        })
        .unwrap();
        event_loop.listen(&socket_path).unwrap();

        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(socket_path).unwrap();
            stream.write_all(b"cmd:job-result\nbody-len:10\n\nabc").unwrap();
            // Keep the connection open well past the read timeout
            thread::sleep(Duration::from_millis(600));
        });

        match event_loop.run() {
            Err(Error::Timeout(timeout)) => assert_eq!(timeout, read_timeout),
            other => panic!("Expected a read timeout, got {:?}", other),
        }
        client.join().unwrap();
    }

    #[test]
    fn peer_not_reading_stalls_writes() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("stalled_write.sock");
        let write_timeout = Duration::from_millis(200);
        let mut event_loop = EventLoop::new(LoopOptions {
            idle_timeout: Duration::from_secs(10),
            write_timeout,
            ..LoopOptions::default()
        })
        .unwrap();
        event_loop.listen(&socket_path).unwrap();

        // Far more than the socket buffer holds
        let reply = Message::new(vec![b'x'; 8 << 20]);
        event_loop.subscribe(move |_, connection, control| control.send(connection, &reply));

        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(socket_path).unwrap();
            stream
                .write_all(&Message::new("gimme").encode().unwrap())
                .unwrap();
            // Never read, but don't hang up either
            thread::sleep(Duration::from_millis(1000));
        });

        match event_loop.run() {
            Err(Error::Timeout(timeout)) => assert_eq!(timeout, write_timeout),
            other => panic!("Expected a write timeout, got {:?}", other),
        }
        client.join().unwrap();
    }

    #[test]
    fn hang_up_while_draining_is_fine() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("drain.sock");
        let mut event_loop = EventLoop::new(short_options()).unwrap();
        event_loop.listen(&socket_path).unwrap();

        let body_len = 4 << 20;
        event_loop.subscribe(move |_, connection, control| {
            control.send(connection, &Message::new(vec![b'y'; body_len]))?;
            control.stop();
            Ok(())
        });

        let client = thread::spawn(move || {
            let bystander = UnixStream::connect(&socket_path).unwrap();
            let mut stream = UnixStream::connect(&socket_path).unwrap();
            stream
                .write_all(&Message::new("last one").encode().unwrap())
                .unwrap();

            // The event loop is now stopping and waits for the reply to drain
            thread::sleep(Duration::from_millis(50));
            drop(bystander);
            thread::sleep(Duration::from_millis(250));

            let mut assembler = MessageAssembler::new();
            let mut replies = Vec::new();
            let mut buf = vec![0u8; 65536];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                replies.extend(assembler.feed(&buf[..n]).unwrap());
            }
            replies
        });

        event_loop.run().unwrap();
        drop(event_loop);

        let replies = client.join().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body().len(), body_len);
    }
}
