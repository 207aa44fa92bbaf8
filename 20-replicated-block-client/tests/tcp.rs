//! End-to-end tests against an in-memory backend over loopback TCP.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::unbounded;
use replicated_block_client::{
    config::ClientConfig,
    error::SessionError,
    protocol::{CommandCode, CommandHeader, Frame, FrameDecoder, SECTOR_SIZE, split_requests},
    runtime::{COMMIT_ACK_BACKLOG, connect},
};

/// Reads at or beyond this sector fail with -EIO.
const FAILING_SECTOR: i64 = 1_000_000;

/// Single-connection backend that keeps sectors in a map.
struct MemoryBackend {
    addr: String,
    ticks: Arc<AtomicUsize>,
    ft_notifications: Arc<AtomicUsize>,
    thread: JoinHandle<Result<()>>,
}

impl MemoryBackend {
    fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ft_notifications = Arc::new(AtomicUsize::new(0));

        let thread = {
            let ticks = Arc::clone(&ticks);
            let ft_notifications = Arc::clone(&ft_notifications);
            thread::spawn(move || -> Result<()> {
                let (stream, _) = listener.accept()?;
                serve(stream, &ticks, &ft_notifications)
            })
        };

        Ok(Self {
            addr,
            ticks,
            ft_notifications,
            thread,
        })
    }

    fn config(&self) -> ClientConfig {
        ClientConfig {
            server: self.addr.clone(),
            ..ClientConfig::default()
        }
    }

    fn join(self) -> Result<()> {
        self.thread.join().expect("backend thread")
    }
}

fn serve(
    mut stream: TcpStream,
    ticks: &AtomicUsize,
    ft_notifications: &AtomicUsize,
) -> Result<()> {
    let mut sectors: HashMap<i64, Vec<u8>> = HashMap::new();
    let mut decoder = FrameDecoder::default();
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        decoder.extend(&buf[..n]);

        while let Some(frame) = decoder.next_frame()? {
            let header = frame.header;
            let reply = match header.code()? {
                CommandCode::Read => {
                    let subs = split_requests(&header, &frame.payload)?;
                    let Some(sub) = subs.first() else {
                        anyhow::bail!("read {} carries no control block", header.id);
                    };
                    if sub.control.sector >= FAILING_SECTOR {
                        let header = CommandHeader::new(CommandCode::Read, header.id, -5, 1);
                        Frame::new(header, Vec::new())
                    } else {
                        let mut data = Vec::new();
                        for i in 0..sub.control.nb_sectors as i64 {
                            match sectors.get(&(sub.control.sector + i)) {
                                Some(sector) => data.extend_from_slice(sector),
                                None => data.extend_from_slice(&[0; SECTOR_SIZE]),
                            }
                        }
                        let len = data.len() as i32;
                        Frame::new(CommandHeader::new(CommandCode::Read, header.id, len, 1), data)
                    }
                }
                CommandCode::Write => {
                    for sub in split_requests(&header, &frame.payload)? {
                        for (i, chunk) in sub.data.chunks(SECTOR_SIZE).enumerate() {
                            sectors.insert(sub.control.sector + i as i64, chunk.to_vec());
                        }
                    }
                    Frame::new(
                        CommandHeader::new(CommandCode::Write, header.id, 0, header.num_reqs),
                        Vec::new(),
                    )
                }
                CommandCode::Commit => {
                    Frame::new(CommandHeader::control(CommandCode::CommitAck), Vec::new())
                }
                CommandCode::EpochTimer => {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                CommandCode::FtNotify => {
                    ft_notifications.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                CommandCode::CommitAck => anyhow::bail!("client sent COMMIT_ACK"),
            };
            stream.write_all(&reply.encode()?)?;
        }
    }
}

/// Accepts one connection, reads a single frame and hangs up without
/// answering it.
fn spawn_hang_up_backend() -> Result<(String, JoinHandle<Result<CommandCode>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    let thread = thread::spawn(move || -> Result<CommandCode> {
        let (mut stream, _) = listener.accept()?;
        let mut decoder = FrameDecoder::default();
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                anyhow::bail!("client closed before sending a frame");
            }
            decoder.extend(&buf[..n]);
            if let Some(frame) = decoder.next_frame()? {
                return Ok(frame.header.code()?);
            }
        }
    });
    Ok((addr, thread))
}

#[test]
fn write_commit_and_read_back() -> Result<()> {
    let backend = MemoryBackend::spawn()?;
    let (handle, acks) = connect(backend.config())?;

    handle.write(8, vec![0xab; 2 * SECTOR_SIZE])?;
    let ack = handle.commit(Duration::from_secs(5))?;
    assert_eq!(ack.epoch, 1);
    assert_eq!(acks.recv_timeout(Duration::from_secs(1))?.epoch, 1);

    let data = handle.read(7, 4)?;
    assert!(data[..SECTOR_SIZE].iter().all(|b| *b == 0));
    assert!(data[SECTOR_SIZE..3 * SECTOR_SIZE].iter().all(|b| *b == 0xab));
    assert!(data[3 * SECTOR_SIZE..].iter().all(|b| *b == 0));

    assert!(handle.drain(Duration::from_secs(5)));
    let stats = handle.session().stats();
    assert_eq!((stats.reads, stats.write_batches, stats.commit_acks), (1, 1, 1));

    handle.shutdown()?;
    backend.join()?;
    Ok(())
}

#[test]
fn remote_failure_reaches_the_caller() -> Result<()> {
    let backend = MemoryBackend::spawn()?;
    let (handle, _acks) = connect(backend.config())?;

    let err = handle
        .read(FAILING_SECTOR, 1)
        .expect_err("backend rejects this sector");
    assert!(format!("{err:#}").contains("-5"), "unexpected error: {err:#}");

    handle.shutdown()?;
    backend.join()?;
    Ok(())
}

#[test]
fn epoch_ticker_and_ft_notification_reach_backend() -> Result<()> {
    let backend = MemoryBackend::spawn()?;
    let config = ClientConfig {
        epoch_interval_ms: Some(20),
        ..backend.config()
    };
    let (handle, _acks) = connect(config)?;
    handle.notify_ft()?;

    let start = Instant::now();
    while backend.ticks.load(Ordering::SeqCst) < 2 {
        if start.elapsed() > Duration::from_secs(5) {
            anyhow::bail!("epoch ticker did not fire");
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(handle.session().stats().epoch_ticks >= 2);

    handle.shutdown()?;
    let ft_notifications = Arc::clone(&backend.ft_notifications);
    backend.join()?;
    assert_eq!(ft_notifications.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn commits_are_numbered_in_order() -> Result<()> {
    let backend = MemoryBackend::spawn()?;
    let (handle, acks) = connect(backend.config())?;

    for expected in 1..=3 {
        assert_eq!(handle.commit(Duration::from_secs(5))?.epoch, expected);
    }
    let epochs: Vec<u64> = acks.try_iter().map(|ack| ack.epoch).collect();
    assert_eq!(epochs, vec![1, 2, 3]);

    handle.shutdown()?;
    backend.join()?;
    Ok(())
}

#[test]
fn shutdown_waits_for_write_acknowledgments() -> Result<()> {
    for round in 0..5 {
        let backend = MemoryBackend::spawn()?;
        let (handle, _acks) = connect(backend.config())?;

        handle.write(round, vec![1; SECTOR_SIZE])?;
        handle.shutdown()?;
        backend.join()?;
    }
    Ok(())
}

#[test]
fn read_fails_once_backend_hangs_up() -> Result<()> {
    let (addr, backend) = spawn_hang_up_backend()?;
    let config = ClientConfig {
        server: addr,
        drain_timeout_ms: 100,
        ..ClientConfig::default()
    };
    let (handle, _acks) = connect(config)?;

    let (done_tx, done_rx) = unbounded();
    let reader = thread::spawn(move || {
        let outcome = handle.read(0, 1);
        let _ = done_tx.send(());
        (outcome, handle)
    });

    done_rx.recv_timeout(Duration::from_secs(5))?;
    let (outcome, handle) = reader.join().expect("reader thread");
    assert_eq!(backend.join().expect("backend thread")?, CommandCode::Read);

    let err = outcome.expect_err("no response can arrive");
    assert!(
        matches!(err.downcast_ref::<SessionError>(), Some(SessionError::Disconnected)),
        "unexpected error: {err:#}"
    );
    assert!(!handle.is_connected());
    assert_eq!(handle.session().pending_count(), 1);

    let err = handle.shutdown().expect_err("the read is still pending");
    assert!(
        matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::OutstandingRequests { .. })
        ),
        "unexpected error: {err:#}"
    );
    Ok(())
}

#[test]
fn commit_acks_beyond_the_backlog_are_dropped() -> Result<()> {
    let backend = MemoryBackend::spawn()?;
    let (handle, acks) = connect(backend.config())?;

    let total = COMMIT_ACK_BACKLOG as u64 + 3;
    for expected in 1..=total {
        assert_eq!(handle.commit(Duration::from_secs(5))?.epoch, expected);
    }
    assert_eq!(acks.len(), COMMIT_ACK_BACKLOG);
    let epochs: Vec<u64> = acks.try_iter().map(|ack| ack.epoch).collect();
    assert_eq!(epochs.first(), Some(&1));
    assert_eq!(epochs.last(), Some(&(COMMIT_ACK_BACKLOG as u64)));

    handle.shutdown()?;
    backend.join()?;
    Ok(())
}
