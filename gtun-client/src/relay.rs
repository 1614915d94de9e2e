//! Packet relay between the TUN device and the server link.
//!
//! Two pumps run for the lifetime of the process. The uplink reads packets
//! from the device and writes them to the link as frames; the downlink reads
//! frames from the link and writes their payloads to the device. Neither pump
//! holds on to a link: after a failure they go back to the [`LinkSlot`] and
//! wait for whatever the supervisor publishes next.

use crate::tunnel::{FailureReporter, LinkSlot, Transport};
use gtun_core::{read_frame, write_frame, MAX_FRAME_LEN};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest packet the relay moves in one piece.
pub const MAX_PACKET_SIZE: usize = MAX_FRAME_LEN;

/// Relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    packets_up: AtomicU64,
    bytes_up: AtomicU64,
    packets_down: AtomicU64,
    bytes_down: AtomicU64,
    /// Packets read from the device that never made it onto a link.
    dropped_up: AtomicU64,
    /// Packets received from the server that the device refused.
    dropped_down: AtomicU64,
}

impl RelayStats {
    fn record_up(&self, bytes: usize) {
        self.packets_up.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_down(&self, bytes: usize) {
        self.packets_down.fetch_add(1, Ordering::Relaxed);
        self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_up: self.packets_up.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            packets_down: self.packets_down.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            dropped_up: self.dropped_up.load(Ordering::Relaxed),
            dropped_down: self.dropped_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub packets_up: u64,
    pub bytes_up: u64,
    pub packets_down: u64,
    pub bytes_down: u64,
    pub dropped_up: u64,
    pub dropped_down: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up={} pkts/{} bytes, down={} pkts/{} bytes, dropped up={} down={}",
            self.packets_up,
            self.bytes_up,
            self.packets_down,
            self.bytes_down,
            self.dropped_up,
            self.dropped_down
        )
    }
}

/// Handles to the two running pumps.
pub struct Relay {
    uplink: JoinHandle<()>,
    downlink: JoinHandle<()>,
}

impl Relay {
    /// Start both pumps.
    pub fn spawn<R, W, S>(
        device_reader: R,
        device_writer: W,
        links: LinkSlot<S>,
        reporter: FailureReporter,
        stats: Arc<RelayStats>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Transport,
    {
        let uplink = tokio::spawn(run_uplink(
            device_reader,
            links.clone(),
            reporter.clone(),
            stats.clone(),
        ));
        let downlink = tokio::spawn(run_downlink(device_writer, links, reporter, stats));
        Self { uplink, downlink }
    }

    /// Resolve when either pump stops on its own, which only happens when the
    /// device or the supervisor goes away.
    pub async fn stopped(&mut self) {
        tokio::select! {
            _ = &mut self.uplink => debug!("Uplink pump exited"),
            _ = &mut self.downlink => debug!("Downlink pump exited"),
        }
    }

    /// Stop both pumps immediately, closing the device halves they own.
    /// In-flight packets are dropped.
    pub async fn shutdown(self) {
        for pump in [self.uplink, self.downlink] {
            pump.abort();
            // A pump that already finished may have been consumed by `stopped`.
            if !pump.is_finished() {
                let _ = pump.await;
            }
        }
    }
}

/// Device -> link.
async fn run_uplink<R, S>(
    mut device: R,
    mut links: LinkSlot<S>,
    reporter: FailureReporter,
    stats: Arc<RelayStats>,
) where
    R: AsyncRead + Unpin,
    S: Transport,
{
    let mut packet = vec![0u8; MAX_PACKET_SIZE];
    let mut stale = None;

    loop {
        let n = match device.read(&mut packet).await {
            Ok(0) => {
                info!("TUN device closed, uplink stopping");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                error!("Error reading from TUN: {}", e);
                return;
            }
        };

        let Some(link) = links.acquire(stale).await else {
            debug!("Supervisor gone, uplink stopping");
            return;
        };
        let generation = link.generation();

        let written = {
            let mut writer = link.writer().await;
            tokio::select! {
                res = write_frame(&mut *writer, &packet[..n]) => Some(res),
                _ = links.replaced(generation) => None,
            }
        };

        match written {
            Some(Ok(())) => stats.record_up(n),
            Some(Err(e)) => {
                stats.dropped_up.fetch_add(1, Ordering::Relaxed);
                warn!("Uplink write on link {} failed: {}", generation, e);
                stale = Some(generation);
                if !reporter.report(generation, e).await {
                    return;
                }
            }
            None => {
                stats.dropped_up.fetch_add(1, Ordering::Relaxed);
                debug!("Link {} replaced mid-write, packet dropped", generation);
            }
        }
    }
}

/// Link -> device.
async fn run_downlink<W, S>(
    mut device: W,
    mut links: LinkSlot<S>,
    reporter: FailureReporter,
    stats: Arc<RelayStats>,
) where
    W: AsyncWrite + Unpin,
    S: Transport,
{
    let mut stale = None;

    loop {
        let Some(link) = links.acquire(stale).await else {
            debug!("Supervisor gone, downlink stopping");
            return;
        };
        let generation = link.generation();
        let mut reader = link.reader().await;

        loop {
            let frame = tokio::select! {
                res = read_frame(&mut *reader) => res,
                _ = links.replaced(generation) => {
                    debug!("Link {} withdrawn, downlink switching", generation);
                    break;
                }
            };

            match frame {
                Ok(packet) => match device.write_all(&packet).await {
                    Ok(()) => stats.record_down(packet.len()),
                    Err(e) => {
                        stats.dropped_down.fetch_add(1, Ordering::Relaxed);
                        warn!("Dropping {} byte packet, TUN write failed: {}", packet.len(), e);
                    }
                },
                Err(e) => {
                    warn!("Downlink read on link {} failed: {}", generation, e);
                    stale = Some(generation);
                    if !reporter.report(generation, e).await {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
