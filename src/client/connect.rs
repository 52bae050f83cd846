use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::pool::Leased;
use crate::{AsyncHandler, Connection, Error, PartitionKey, Transport};

use super::attempt::Ctx;

/// Resolved addresses of a partition and how far the request got trying them.
#[derive(Debug)]
pub(crate) struct Addresses {
    addrs: Vec<SocketAddr>,
    next: usize,
}

impl Addresses {
    fn new(addrs: Vec<SocketAddr>) -> Self {
        Addresses { addrs, next: 0 }
    }

    fn is_exhausted(&self) -> bool {
        self.next >= self.addrs.len()
    }

    /// Up to `n` addresses not tried yet.
    fn take(&mut self, n: usize) -> Vec<SocketAddr> {
        let end = (self.next + n).min(self.addrs.len());
        let taken = self.addrs[self.next..end].to_vec();
        self.next = end;
        taken
    }
}

type ConnectResult<C> = (SocketAddr, Result<C, Error>);

/// Get a connection for the Attempt.
///
/// In order: a connection kept from the previous Attempt, an idle pooled
/// connection, a new one. A new connection takes a pool slot before the
/// first address is dialed and gives it back if every dial fails.
pub(crate) async fn open_connection<T: Transport, H: AsyncHandler>(
    ctx: &mut Ctx<'_, T, H>,
    key: &PartitionKey,
    reuse: Option<Leased<T::Conn>>,
) -> Result<Leased<T::Conn>, Error> {
    if let Some(conn) = reuse {
        if conn.is_open() {
            debug!("Continue on same connection: {}", key);
            return Ok(conn);
        }
    }

    let client = ctx.client;

    ctx.handler.on_connection_pool_attempt();
    if let Some(conn) = client.pool.try_acquire(key)? {
        ctx.handler.on_connection_pooled(conn.remote_addr());
        return Ok(conn);
    }

    let slot = client.pool.preempt(key)?;

    let candidates = next_addresses(ctx, key).await?;

    let (addr, conn) = if candidates.len() == 1 {
        connect_one(ctx, candidates[0], key).await?
    } else {
        race(ctx, candidates, key).await?
    };

    if conn.is_secure() {
        ctx.handler.on_tls_handshake_completed();
    }
    ctx.handler.on_tcp_connect_success(addr);

    debug!("Connected {} for {}", addr, key);

    Ok(slot.attach(conn))
}

async fn next_addresses<T: Transport, H: AsyncHandler>(
    ctx: &mut Ctx<'_, T, H>,
    key: &PartitionKey,
) -> Result<Vec<SocketAddr>, Error> {
    let client = ctx.client;
    let exhausted = ctx
        .addresses
        .as_ref()
        .map(|a| a.is_exhausted())
        .unwrap_or(true);

    if exhausted {
        let (host, port) = key.connect_target();

        ctx.handler.on_hostname_resolution_attempt(host);
        let addrs = client.transport.resolve(host, port).await?;
        if addrs.is_empty() {
            return Err(Error::NoAddress(host.to_string()));
        }
        ctx.handler.on_hostname_resolved(host, &addrs);

        trace!("Resolved {}: {:?}", host, addrs);
        *ctx.addresses = Some(Addresses::new(addrs));
    }

    let n = client.config.connect_race.max(1);

    Ok(ctx
        .addresses
        .as_mut()
        .map(|a| a.take(n))
        .unwrap_or_default())
}

async fn dial<T: Transport>(
    transport: &T,
    addr: SocketAddr,
    key: &PartitionKey,
    after: Duration,
) -> Result<T::Conn, Error> {
    match tokio::time::timeout(after, transport.connect(addr, key)).await {
        Ok(r) => r,
        Err(_) => Err(Error::ConnectTimeout {
            after,
            remote: addr,
        }),
    }
}

async fn connect_one<T: Transport, H: AsyncHandler>(
    ctx: &mut Ctx<'_, T, H>,
    addr: SocketAddr,
    key: &PartitionKey,
) -> Result<(SocketAddr, T::Conn), Error> {
    let client = ctx.client;

    ctx.handler.on_tcp_connect_attempt(addr);

    match dial(&client.transport, addr, key, client.config.connect_timeout).await {
        Ok(conn) => Ok((addr, conn)),
        Err(e) => {
            debug!("Connect to {} failed: {}", addr, e);
            ctx.handler.on_tcp_connect_failure(addr, &e);
            Err(e)
        }
    }
}

/// Dial several addresses at once, keeping the first to connect.
async fn race<T: Transport, H: AsyncHandler>(
    ctx: &mut Ctx<'_, T, H>,
    candidates: Vec<SocketAddr>,
    key: &PartitionKey,
) -> Result<(SocketAddr, T::Conn), Error> {
    let after = ctx.client.config.connect_timeout;
    let mut set: JoinSet<ConnectResult<T::Conn>> = JoinSet::new();

    for addr in candidates {
        ctx.handler.on_tcp_connect_attempt(addr);

        let client = ctx.client.clone();
        let key = key.clone();

        set.spawn(async move {
            let result = dial(&client.transport, addr, &key, after).await;
            (addr, result)
        });
    }

    let mut last = None;

    while let Some(joined) = set.join_next().await {
        let (addr, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                last = Some(Error::Io {
                    kind: std::io::ErrorKind::Other,
                    message: e.to_string(),
                });
                continue;
            }
        };

        match result {
            Ok(conn) => {
                if !set.is_empty() {
                    tokio::spawn(close_losers(set));
                }
                return Ok((addr, conn));
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                ctx.handler.on_tcp_connect_failure(addr, &e);
                last = Some(e);
            }
        }
    }

    Err(last.unwrap_or_else(|| Error::NoAddress(key.host().to_string())))
}

async fn close_losers<C: Connection>(mut set: JoinSet<ConnectResult<C>>) {
    while let Some(joined) = set.join_next().await {
        if let Ok((addr, Ok(mut conn))) = joined {
            trace!("Close connection that lost the race: {}", addr);
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn addresses_taken_in_order() {
        let mut a = Addresses::new(vec![addr(1), addr(2), addr(3)]);
        assert_eq!(a.take(2), vec![addr(1), addr(2)]);
        assert!(!a.is_exhausted());
        assert_eq!(a.take(2), vec![addr(3)]);
        assert!(a.is_exhausted());
        assert!(a.take(1).is_empty());
    }
}
