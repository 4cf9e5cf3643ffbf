//! Async front-end around the tick-driven engine.
//!
//! A tokio task owns the [`Engine`](crate::Engine) and pumps it: link-layer
//! packets and flux samples go in through bounded channels, transmitted
//! packets come out the same way. The channel bounds are the ready/valid
//! contract at the crate boundary — a full queue stalls the producer, an
//! empty one parks the pump.

use bytes::{Bytes, BytesMut};
use futures::{sink, stream, Sink, SinkExt, Stream, StreamExt};
use std::{
    fmt,
    future::Future,
    io::{Error, ErrorKind, Result},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{sync::mpsc, task::JoinSet};

use crate::drive::FluxSample;
use crate::engine::{Engine, EngineConfig};
use crate::msc::ScsiEngine;
use crate::packet::LinkEvent;

/// Ticks advanced per pump pass while the engine has in-flight work.
const TICK_BATCH: u32 = 4096;

#[derive(Debug)]
enum LinkMsg {
    /// One received packet; end-of-packet is implied after the last byte.
    Packet(Bytes),
    /// Bus reset seen on the line.
    Reset,
}

/// Sends received link-layer packets into the engine.
pub struct BusSender {
    tx: mpsc::Sender<LinkMsg>,
}

impl fmt::Debug for BusSender {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BusSender").finish()
    }
}

impl BusSender {
    /// Delivers one packet's bytes, PID first.
    pub async fn send(&self, packet: Bytes) -> Result<()> {
        self.tx
            .send(LinkMsg::Packet(packet))
            .await
            .map_err(|_| Error::new(ErrorKind::BrokenPipe, "bus task terminated"))
    }

    /// Signals a bus reset.
    pub async fn reset(&self) -> Result<()> {
        self.tx
            .send(LinkMsg::Reset)
            .await
            .map_err(|_| Error::new(ErrorKind::BrokenPipe, "bus task terminated"))
    }

    /// Wait until the bus is closed.
    pub fn closed(&self) -> impl Future<Output = ()> {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }

    /// Turns this into a sink for received packets.
    pub fn into_sink(self) -> PacketSink {
        let sink = sink::unfold(self, |this, packet: Bytes| async move {
            this.send(packet).await?;
            Ok(this)
        });

        PacketSink(Box::pin(sink))
    }
}

/// Packet sink into the engine.
pub struct PacketSink(Pin<Box<dyn Sink<Bytes, Error = Error> + Send + 'static>>);

impl fmt::Debug for PacketSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PacketSink").finish()
    }
}

impl Sink<Bytes> for PacketSink {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        Pin::into_inner(self).0.poll_ready_unpin(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<()> {
        Pin::into_inner(self).0.start_send_unpin(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        Pin::into_inner(self).0.poll_flush_unpin(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        Pin::into_inner(self).0.poll_close_unpin(cx)
    }
}

/// Receives packets transmitted by the engine.
pub struct BusReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl fmt::Debug for BusReceiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BusReceiver").finish()
    }
}

impl BusReceiver {
    /// Receives one transmitted packet.
    pub async fn recv(&mut self) -> Result<Bytes> {
        self.rx.recv().await.ok_or_else(|| Error::new(ErrorKind::BrokenPipe, "bus task terminated"))
    }

    /// Turns this into a stream of transmitted packets.
    pub fn into_stream(self) -> PacketStream {
        let stream = stream::try_unfold(self, |mut this| async move {
            match this.recv().await {
                Ok(packet) => Ok(Some((packet, this))),
                Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(None),
                Err(err) => Err(err),
            }
        });

        PacketStream(Box::pin(stream))
    }
}

/// Stream of packets transmitted by the engine.
pub struct PacketStream(Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>);

impl fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PacketStream").finish()
    }
}

impl Stream for PacketStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        Pin::into_inner(self).0.poll_next_unpin(cx)
    }
}

/// Feeds capture flux samples to the active personality.
pub struct FluxFeeder {
    tx: mpsc::Sender<FluxSample>,
}

impl fmt::Debug for FluxFeeder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FluxFeeder").finish()
    }
}

impl FluxFeeder {
    /// Delivers one sample; waits while the engine is backpressured.
    pub async fn feed(&self, sample: FluxSample) -> Result<()> {
        self.tx
            .send(sample)
            .await
            .map_err(|_| Error::new(ErrorKind::BrokenPipe, "bus task terminated"))
    }
}

/// Owner of the pump task.
pub struct UsbBus {
    task: JoinSet<Result<()>>,
}

impl fmt::Debug for UsbBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsbBus").finish()
    }
}

impl UsbBus {
    /// Starts the pump around a new engine and returns the handles.
    pub fn new<S>(config: EngineConfig, scsi: S) -> (UsbBus, BusSender, BusReceiver, FluxFeeder)
    where
        S: ScsiEngine + Send + 'static,
    {
        let engine = Engine::new(config, scsi);
        let (link_tx, link_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (flux_tx, flux_rx) = mpsc::channel(64);

        let mut task = JoinSet::new();
        task.spawn(Self::pump(engine, link_rx, out_tx, flux_rx));

        (
            UsbBus { task },
            BusSender { tx: link_tx },
            BusReceiver { rx: out_rx },
            FluxFeeder { tx: flux_tx },
        )
    }

    /// Waits for the pump task to finish.
    pub async fn closed(&mut self) -> Result<()> {
        match self.task.join_next().await {
            Some(Ok(res)) => res,
            Some(Err(err)) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn pump<S: ScsiEngine>(
        mut engine: Engine<S>, mut link_rx: mpsc::Receiver<LinkMsg>, out_tx: mpsc::Sender<Bytes>,
        mut flux_rx: mpsc::Receiver<FluxSample>,
    ) -> Result<()> {
        let mut tx_buf = BytesMut::new();
        let mut pending_flux: Option<FluxSample> = None;
        let mut flux_open = true;

        loop {
            // Drain transmit bytes into whole packets.
            while let Some(tx) = engine.poll_link_tx() {
                tx_buf.extend_from_slice(&[tx.byte]);
                if tx.last {
                    let packet = tx_buf.split().freeze();
                    if out_tx.send(packet).await.is_err() {
                        tracing::debug!("receiver dropped");
                        return Ok(());
                    }
                }
            }

            // Retry a sample the codec refused earlier.
            if let Some(sample) = pending_flux.take() {
                if !engine.offer_flux(sample) {
                    pending_flux = Some(sample);
                }
            }

            if engine.needs_ticks() || pending_flux.is_some() {
                for _ in 0..TICK_BATCH {
                    engine.tick();
                }
                // Keep consuming inputs while working so aborts get through.
                match link_rx.try_recv() {
                    Ok(msg) => Self::deliver(&mut engine, msg),
                    Err(mpsc::error::TryRecvError::Empty) => (),
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
                if pending_flux.is_none() && flux_open {
                    if let Ok(sample) = flux_rx.try_recv() {
                        if !engine.offer_flux(sample) {
                            pending_flux = Some(sample);
                        }
                    }
                }
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                msg = link_rx.recv() => match msg {
                    Some(msg) => Self::deliver(&mut engine, msg),
                    None => break,
                },
                sample = flux_rx.recv(), if flux_open => match sample {
                    Some(sample) => {
                        if !engine.offer_flux(sample) {
                            pending_flux = Some(sample);
                        }
                    }
                    None => flux_open = false,
                },
            }
        }

        tracing::debug!("bus closed");
        Ok(())
    }

    fn deliver<S: ScsiEngine>(engine: &mut Engine<S>, msg: LinkMsg) {
        match msg {
            LinkMsg::Packet(packet) => {
                #[cfg(feature = "trace-bytes")]
                tracing::trace!("received packet of {} bytes", packet.len());
                for &b in packet.iter() {
                    engine.handle_link(LinkEvent::Byte(b));
                }
                engine.handle_link(LinkEvent::Eop);
            }
            LinkMsg::Reset => engine.handle_link(LinkEvent::Reset),
        }
    }
}
