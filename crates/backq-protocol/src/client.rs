use crate::{BeanstalkCodec, Command, ProtocolError, Response, Result, Stats};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// A job handed out by `reserve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub id: u64,
    pub body: Vec<u8>,
}

/// Request/response operations a queue adapter needs from a broker
#[async_trait]
pub trait BrokerClient: Send {
    async fn connect(&mut self, address: &str, timeout: Duration) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Add a tube to the watch list, returning the number of watched tubes
    async fn watch(&mut self, tube: &str) -> Result<u32>;

    /// Remove a tube from the watch list, returning the number of watched tubes
    async fn ignore(&mut self, tube: &str) -> Result<u32>;

    /// Select the tube `put` writes to
    async fn use_tube(&mut self, tube: &str) -> Result<()>;

    /// Lease the next ready job; `None` timeout waits indefinitely
    async fn reserve(&mut self, timeout: Option<Duration>) -> Result<Option<ReservedJob>>;

    async fn put(&mut self, priority: u32, delay: Duration, ttr: Duration, body: &[u8])
        -> Result<u64>;

    async fn release(&mut self, id: u64, priority: u32, delay: Duration) -> Result<()>;

    async fn delete(&mut self, id: u64) -> Result<()>;

    /// Server statistics, or statistics of one tube
    async fn stats(&mut self, tube: Option<&str>) -> Result<Stats>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Async TCP client for beanstalkd
pub struct BeanstalkClient {
    framed: Option<Framed<TcpStream, BeanstalkCodec>>,
    io_timeout: Duration,
}

impl BeanstalkClient {
    pub fn new(io_timeout: Duration) -> Self {
        BeanstalkClient {
            framed: None,
            io_timeout,
        }
    }

    /// Send one command and wait for its reply. Transport failures drop the
    /// connection so a half-read reply never answers the next command.
    async fn request(&mut self, command: Command, wait: Option<Duration>) -> Result<Response> {
        let name = command.name();
        let framed = self.framed.as_mut().ok_or(ProtocolError::NotConnected)?;
        let exchange = exchange(framed, command);

        let result = match wait {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or(Err(ProtocolError::Timeout)),
            None => exchange.await,
        };

        match result {
            Ok(Response::Error(error)) => Err(ProtocolError::Server(error)),
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_transport() {
                    debug!("Dropping beanstalkd connection after {} failed: {}", name, e);
                    self.framed = None;
                }
                Err(e)
            }
        }
    }

    fn unexpected(command: &str, response: Response) -> ProtocolError {
        ProtocolError::UnexpectedResponse(format!("{} answered with {:?}", command, response))
    }
}

async fn exchange(
    framed: &mut Framed<TcpStream, BeanstalkCodec>,
    command: Command,
) -> Result<Response> {
    framed.send(command).await?;
    framed
        .next()
        .await
        .unwrap_or(Err(ProtocolError::ConnectionClosed))
}

impl Default for BeanstalkClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl BrokerClient for BeanstalkClient {
    async fn connect(&mut self, address: &str, timeout: Duration) -> Result<()> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        stream.set_nodelay(true)?;

        self.framed = Some(Framed::new(stream, BeanstalkCodec));
        debug!("Connected to beanstalkd at {}", address);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    async fn watch(&mut self, tube: &str) -> Result<u32> {
        match self.request(Command::Watch(tube.to_string()), Some(self.io_timeout)).await? {
            Response::Watching(count) => Ok(count),
            other => Err(Self::unexpected("watch", other)),
        }
    }

    async fn ignore(&mut self, tube: &str) -> Result<u32> {
        match self.request(Command::Ignore(tube.to_string()), Some(self.io_timeout)).await? {
            Response::Watching(count) => Ok(count),
            Response::NotIgnored => Err(ProtocolError::Server("NOT_IGNORED".to_string())),
            other => Err(Self::unexpected("ignore", other)),
        }
    }

    async fn use_tube(&mut self, tube: &str) -> Result<()> {
        match self.request(Command::Use(tube.to_string()), Some(self.io_timeout)).await? {
            Response::Using(_) => Ok(()),
            other => Err(Self::unexpected("use", other)),
        }
    }

    async fn reserve(&mut self, timeout: Option<Duration>) -> Result<Option<ReservedJob>> {
        let (command, wait) = match timeout {
            Some(limit) => (
                Command::ReserveWithTimeout(limit.as_secs()),
                Some(limit + self.io_timeout),
            ),
            None => (Command::Reserve, None),
        };

        match self.request(command, wait).await? {
            Response::Reserved { id, body } => Ok(Some(ReservedJob {
                id,
                body: body.to_vec(),
            })),
            Response::TimedOut | Response::DeadlineSoon => Ok(None),
            other => Err(Self::unexpected("reserve", other)),
        }
    }

    async fn put(
        &mut self,
        priority: u32,
        delay: Duration,
        ttr: Duration,
        body: &[u8],
    ) -> Result<u64> {
        let command = Command::Put {
            priority,
            delay: delay.as_secs(),
            ttr: ttr.as_secs().max(1),
            body: Bytes::copy_from_slice(body),
        };

        match self.request(command, Some(self.io_timeout)).await? {
            Response::Inserted(id) => Ok(id),
            Response::Buried(_) => Err(ProtocolError::Server("BURIED".to_string())),
            other => Err(Self::unexpected("put", other)),
        }
    }

    async fn release(&mut self, id: u64, priority: u32, delay: Duration) -> Result<()> {
        let command = Command::Release {
            id,
            priority,
            delay: delay.as_secs(),
        };

        match self.request(command, Some(self.io_timeout)).await? {
            Response::Released => Ok(()),
            Response::Buried(_) => Err(ProtocolError::Server("BURIED".to_string())),
            Response::NotFound => Err(ProtocolError::NotFound),
            other => Err(Self::unexpected("release", other)),
        }
    }

    async fn delete(&mut self, id: u64) -> Result<()> {
        match self.request(Command::Delete(id), Some(self.io_timeout)).await? {
            Response::Deleted => Ok(()),
            Response::NotFound => Err(ProtocolError::NotFound),
            other => Err(Self::unexpected("delete", other)),
        }
    }

    async fn stats(&mut self, tube: Option<&str>) -> Result<Stats> {
        let command = match tube {
            Some(tube) => Command::StatsTube(tube.to_string()),
            None => Command::Stats,
        };

        match self.request(command, Some(self.io_timeout)).await? {
            Response::Ok(body) => Stats::from_yaml(&body),
            Response::NotFound => Err(ProtocolError::NotFound),
            other => Err(Self::unexpected("stats", other)),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut framed = self.framed.take().ok_or(ProtocolError::NotConnected)?;
        // beanstalkd closes the socket on quit without replying; the
        // connection is gone either way
        if let Err(e) = framed.send(Command::Quit).await {
            debug!("quit was not delivered: {}", e);
        }
        Ok(())
    }
}
