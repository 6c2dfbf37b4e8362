use std::{io, thread};

use comms::{
    Collective, TcpGroup,
    msg::{Command, Msg, Payload},
};
use tokio::io as tokio_io;

#[tokio::test]
async fn send_recv_over_duplex() -> io::Result<()> {
    const SIZE: usize = 256;

    let (one, two) = tokio_io::duplex(SIZE);
    let (rx, tx) = tokio_io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    let (two_rx, two_tx) = tokio_io::split(two);
    let (mut rx, _) = comms::channel(two_rx, two_tx);

    let grad = [0.5f32, -1.0, 3.25];
    tx.send(&Msg::Data(Payload::Single(&grad))).await?;
    let hello = Msg::Control(Command::Hello {
        rank: 1,
        world_size: 2,
    });
    tx.send(&hello).await?;
    // prefix + kind + body: 12 payload bytes, then the json command
    let json = r#"{"hello":{"rank":1,"world_size":2}}"#;
    assert_eq!(tx.bytes_sent() as usize, (8 + 8 + 12) + (8 + 8 + json.len()));

    let mut buf: Vec<u64> = Vec::new();
    match rx.recv_into(&mut buf).await? {
        Msg::Data(Payload::Single(got)) => assert_eq!(got, grad),
        other => panic!("unexpected message {other:?}"),
    }

    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, hello);

    Ok(())
}

#[test]
fn tcp_group_reduces_across_processes() {
    const WORLD: usize = 3;

    // Reserve a free port, then release it for the coordinator to bind.
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let handles: Vec<_> = (0..WORLD)
        .map(|rank| {
            thread::spawn(move || {
                let mut group = TcpGroup::connect(addr, rank, WORLD).unwrap();
                assert_eq!(group.world_size(), WORLD);

                let mut grad = [rank as f32, 1.];
                group.all_reduce_sum(&mut grad).unwrap();

                let mut totals = [rank as f64 * 0.5, 2.];
                group.all_reduce_sum_f64(&mut totals).unwrap();

                group.barrier().unwrap();
                (grad, totals)
            })
        })
        .collect();

    for handle in handles {
        let (grad, totals) = handle.join().unwrap();
        assert_eq!(grad, [3., 3.]);
        assert_eq!(totals, [1.5, 6.]);
    }
}

#[test]
fn a_departed_rank_aborts_the_reduction_everywhere() {
    const WORLD: usize = 3;

    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let handles: Vec<_> = (0..WORLD)
        .map(|rank| {
            thread::spawn(move || {
                let mut group = TcpGroup::connect(addr, rank, WORLD).unwrap();
                if rank == 2 {
                    // leaves before the first reduction
                    return None;
                }

                let mut grad = [1f32];
                Some(group.all_reduce_sum(&mut grad).unwrap_err())
            })
        })
        .collect();

    let errs: Vec<io::Error> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(errs.len(), 2);
    for err in &errs {
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(err.to_string().contains("rank 2 left the group"), "{err}");
    }
}
