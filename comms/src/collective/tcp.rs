use std::{borrow::Cow, io, time::Duration};

use log::{debug, info};
use tokio::{
    net::{
        TcpListener, TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{Builder, Runtime},
    time,
};

use super::{Collective, length_mismatch, reducible::Reducible};
use crate::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg},
};

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;

const CONNECT_ATTEMPTS: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

enum Links {
    /// The coordinator holds one link per peer, indexed by `rank - 1`.
    Root(Vec<(NetRx, NetTx)>),
    Leaf(NetRx, NetTx),
}

/// A group whose ranks are separate processes connected in a star around rank 0.
///
/// Every reduction sends the local buffer to the coordinator, which sums the
/// contributions in rank order and sends the result back to every peer. When a
/// peer's link fails the coordinator sends the cause to the others instead.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    runtime: Runtime,
    links: Links,
    rx_buf: Vec<u64>,
}

impl TcpGroup {
    /// Joins a group, blocking until every rank is connected.
    ///
    /// Rank 0 listens on `addr`, every other rank connects to it, retrying while
    /// the coordinator is not up yet.
    ///
    /// # Arguments
    /// * `addr` - The rendezvous address of the coordinator.
    /// * `rank` - The rank of this process.
    /// * `world_size` - The amount of ranks in the group.
    ///
    /// # Returns
    /// The connected group or an io error.
    pub fn connect<A>(addr: A, rank: usize, world_size: usize) -> io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        if rank >= world_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {rank} is out of range for a world of size {world_size}"),
            ));
        }

        let runtime = Builder::new_current_thread().enable_all().build()?;
        let links = runtime.block_on(async {
            if rank == 0 {
                Self::accept_peers(addr, world_size).await
            } else {
                Self::join_root(addr, rank, world_size).await
            }
        })?;

        info!(rank = rank, world_size = world_size; "joined tcp process group");

        Ok(Self {
            rank,
            world_size,
            runtime,
            links,
            rx_buf: Vec::new(),
        })
    }

    async fn accept_peers<A: ToSocketAddrs>(addr: A, world_size: usize) -> io::Result<Links> {
        let listener = TcpListener::bind(addr).await?;
        let mut peers: Vec<Option<(NetRx, NetTx)>> = (1..world_size).map(|_| None).collect();
        let mut buf: Vec<u64> = Vec::new();

        while peers.iter().any(Option::is_none) {
            let (stream, peer_addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let (rx, tx) = stream.into_split();
            let (mut rx, tx) = crate::channel(rx, tx);

            let peer_rank = match rx.recv_into(&mut buf).await? {
                Msg::Control(Command::Hello {
                    rank,
                    world_size: theirs,
                }) if theirs == world_size && rank > 0 && rank < world_size => rank,
                msg => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid handshake from {peer_addr}: {msg:?}"),
                    ));
                }
            };

            debug!("rank {peer_rank} connected from {peer_addr}");
            if peers[peer_rank - 1].replace((rx, tx)).is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("rank {peer_rank} joined twice"),
                ));
            }
        }

        Ok(Links::Root(peers.into_iter().flatten().collect()))
    }

    async fn join_root<A: ToSocketAddrs>(
        addr: A,
        rank: usize,
        world_size: usize,
    ) -> io::Result<Links> {
        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    debug!("coordinator not reachable yet ({e}), retrying");
                    attempt += 1;
                    time::sleep(CONNECT_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        };

        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, mut tx) = crate::channel(rx, tx);
        tx.send(&Msg::Control(Command::Hello { rank, world_size }))
            .await?;

        Ok(Links::Leaf(rx, tx))
    }

    fn all_reduce<T: Reducible>(&mut self, buf: &mut [T]) -> io::Result<()> {
        let Self {
            runtime,
            links,
            rx_buf,
            ..
        } = self;

        runtime.block_on(async {
            match links {
                Links::Root(peers) => reduce_as_root(peers, rx_buf, buf).await,
                Links::Leaf(rx, tx) => reduce_as_leaf(rx, tx, rx_buf, buf).await,
            }
        })
    }
}

async fn reduce_as_root<T: Reducible>(
    peers: &mut [(NetRx, NetTx)],
    rx_buf: &mut Vec<u64>,
    buf: &mut [T],
) -> io::Result<()> {
    let mut acc: Vec<f64> = buf.iter().map(|x| x.to_f64()).collect();

    if let Err(e) = gather::<T>(peers, rx_buf, &mut acc).await {
        // Peers blocked on the result learn why the round was aborted.
        let detail = e.to_string();
        for (_, tx) in peers.iter_mut() {
            if let Err(send_err) = tx.send(&Msg::Err(Cow::Borrowed(detail.as_str()))).await {
                debug!("could not forward the failure to a peer: {send_err}");
            }
        }

        return Err(e);
    }

    for (x, r) in buf.iter_mut().zip(&acc) {
        *x = T::from_f64(*r);
    }

    for (_, tx) in peers.iter_mut() {
        tx.send(&Msg::Data(T::payload(buf))).await?;
    }

    Ok(())
}

/// Adds every peer's contribution into `acc`, in rank order.
async fn gather<T: Reducible>(
    peers: &mut [(NetRx, NetTx)],
    rx_buf: &mut Vec<u64>,
    acc: &mut [f64],
) -> io::Result<()> {
    for (i, (rx, _)) in peers.iter_mut().enumerate() {
        let rank = i + 1;
        let msg: Msg = rx.recv_into(rx_buf).await.map_err(|e| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("rank {rank} left the group: {e}"),
            )
        })?;
        let nums = take_payload::<T>(msg)?;

        if nums.len() != acc.len() {
            return Err(length_mismatch(nums.len(), acc.len()));
        }

        acc.iter_mut().zip(nums).for_each(|(a, x)| *a += x.to_f64());
    }

    Ok(())
}

async fn reduce_as_leaf<T: Reducible>(
    rx: &mut NetRx,
    tx: &mut NetTx,
    rx_buf: &mut Vec<u64>,
    buf: &mut [T],
) -> io::Result<()> {
    tx.send(&Msg::Data(T::payload(buf))).await?;

    let msg: Msg = rx.recv_into(rx_buf).await.map_err(|e| {
        io::Error::new(
            io::ErrorKind::ConnectionAborted,
            format!("the coordinator left the group: {e}"),
        )
    })?;
    let nums = take_payload::<T>(msg)?;

    if nums.len() != buf.len() {
        return Err(length_mismatch(nums.len(), buf.len()));
    }

    buf.copy_from_slice(nums);
    Ok(())
}

fn take_payload<T: Reducible>(msg: Msg<'_>) -> io::Result<&[T]> {
    let kind = msg.kind();

    let nums = match msg {
        Msg::Data(payload) => T::from_payload(payload),
        Msg::Err(detail) => {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("the coordinator aborted the reduction: {detail}"),
            ));
        }
        Msg::Control(_) => None,
    };

    nums.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected a reduction payload, got {kind}"),
        )
    })
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> io::Result<()> {
        self.all_reduce(buf)
    }

    fn all_reduce_sum_f64(&mut self, buf: &mut [f64]) -> io::Result<()> {
        self.all_reduce(buf)
    }
}
