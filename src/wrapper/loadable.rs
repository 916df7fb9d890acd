//! The loadable hosted by the wrapper's loader: opens the transport,
//! selects an extractor and pumps it until completion, cancellation or
//! failure.
//!
//! One instance exists per transport attempt; a UDP→TCP failover builds a
//! fresh loadable in the "already open" state so that no second
//! `PrepareStarted` is announced and the load condition released by the
//! dying predecessor lets it through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, StreamError};
use crate::extractor::{
    ExtractorDriver, ExtractorOutput, MediaInput, ReadAction, select_extractor, sniff_raw,
};
use crate::loader::Loadable;
use crate::rtcp::RtcpListener;
use crate::transport::udp::{RawUdpSource, RtpUdpSource, UdpEndpoint, UdpRtcpSink};
use crate::transport::tcp::InterleavedSource;
use crate::transport::{MediaSource, TransportProtocol};

use super::WrapperCore;

/// Which transport this loadable drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadableMode {
    Udp,
    Interleaved,
}

pub(crate) struct MediaLoadable {
    core: Arc<WrapperCore>,
    mode: LoadableMode,
    /// True while the open phase has succeeded and the load is live.
    opened: AtomicBool,
    canceled: AtomicBool,
    released: AtomicBool,
    closed: AtomicBool,
    /// An open-phase failure was already reported as `PrepareFailure`.
    open_failed: AtomicBool,
    /// The extractor must seek to the pending reset position.
    pending_reset: AtomicBool,
    udp_endpoint: Mutex<Option<Arc<UdpEndpoint>>>,
    rtcp_sink: Mutex<Option<Arc<dyn RtcpListener>>>,
}

impl MediaLoadable {
    pub fn new(core: Arc<WrapperCore>, mode: LoadableMode, opened_already: bool) -> Self {
        MediaLoadable {
            core,
            mode,
            opened: AtomicBool::new(opened_already),
            canceled: AtomicBool::new(false),
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            open_failed: AtomicBool::new(false),
            pending_reset: AtomicBool::new(false),
            udp_endpoint: Mutex::new(None),
            rtcp_sink: Mutex::new(None),
        }
    }

    pub fn open_failed(&self) -> bool {
        self.open_failed.load(Ordering::SeqCst)
    }

    /// Ask the load loop to service the pending reset position on its
    /// next iteration.
    pub fn seek_load(&self) {
        self.pending_reset.store(true, Ordering::SeqCst);
    }

    /// The UDP endpoint's local RTP port, once bound.
    pub fn local_port(&self) -> Option<u16> {
        self.udp_endpoint.lock().as_ref().map(|e| e.local_port())
    }

    /// Send one NAT punch datagram. Failures are logged and swallowed.
    pub fn punch(&self, host: &str, port: u16) {
        let endpoint = self.udp_endpoint.lock().clone();
        let Some(endpoint) = endpoint else {
            tracing::debug!(host, port, "NAT punch skipped, no UDP endpoint");
            return;
        };
        match endpoint.write_to(&crate::transport::udp::NAT_PUNCH_MAGIC, host, port) {
            Ok(_) => tracing::debug!(host, port, "NAT punch sent"),
            Err(e) => tracing::debug!(host, port, error = %e, "NAT punch failed"),
        }
    }

    /// Release the loadable: close the transport and unblock the load
    /// condition. Legal while the load is open.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.canceled.store(true, Ordering::SeqCst);
        self.close_internal();
    }

    fn run(&self) -> Result<()> {
        let mut driver = self.open_internal()?;
        let result = self.load_media(&mut driver);
        driver.release();
        result
    }

    fn open_internal(&self) -> Result<ExtractorDriver> {
        let driver = match self.build_driver() {
            Ok(driver) => driver,
            Err(e) => {
                self.maybe_failure_open(&e);
                return Err(e);
            }
        };

        self.maybe_finish_open();

        if self.opened.load(Ordering::SeqCst) {
            // Suspend until playback opens the gate, or cancel/release
            // opens it to let us exit.
            self.core.load_condition.block();
            if self.opened.load(Ordering::SeqCst) && !self.released.load(Ordering::SeqCst) {
                let mut driver = driver;
                let output: Arc<dyn ExtractorOutput> = self.core.clone();
                driver.init(output);
                return Ok(driver);
            }
        }

        let e = StreamError::Canceled;
        self.maybe_failure_open(&e);
        Err(e)
    }

    fn build_driver(&self) -> Result<ExtractorDriver> {
        let track = &self.core.track;
        let transport = self.core.current_transport();
        let session = &self.core.session;
        let config = &self.core.config;

        match self.mode {
            LoadableMode::Udp => {
                let rtcp_muxed = session.is_rtcp_muxed() || track.muxed;
                let endpoint = Arc::new(UdpEndpoint::bind_pair(
                    config.read_timeout,
                    // Non-RTP transports carry no RTCP; a single socket
                    // suffices.
                    rtcp_muxed || transport.protocol != TransportProtocol::Rtp,
                )?);
                self.core.set_local_port(endpoint.local_port());
                *self.udp_endpoint.lock() = Some(endpoint.clone());

                let source: Box<dyn MediaSource> = match transport.protocol {
                    TransportProtocol::Rtp => {
                        let rtcp_enabled = session.is_rtcp_supported();
                        if rtcp_enabled {
                            self.core.rtcp_in.open();
                            self.core.rtcp_out.open();
                            self.register_udp_rtcp_sink(&endpoint);
                        }
                        Box::new(RtpUdpSource::new(
                            endpoint,
                            track.payload.clock_rate,
                            transport.ssrc,
                            rtcp_enabled,
                            rtcp_muxed,
                            self.core.rtcp_in.clone(),
                            self.core.transfer.clone(),
                        ))
                    }
                    TransportProtocol::Mp2t | TransportProtocol::Raw => {
                        Box::new(RawUdpSource::new(endpoint, self.core.transfer.clone()))
                    }
                };

                self.select(source, transport.protocol)
            }
            LoadableMode::Interleaved => {
                // The interleaved path carries RTP only; anything else
                // would leave the track without a data source.
                if transport.protocol != TransportProtocol::Rtp {
                    return Err(StreamError::UnsupportedProtocol(format!(
                        "interleaved transport requires RTP, got {:?}",
                        transport.protocol
                    )));
                }
                if session.is_rtcp_supported() {
                    self.core.rtcp_in.open();
                    self.core.rtcp_out.open();
                }
                let source = Box::new(InterleavedSource::new(
                    self.core.packet_queue.clone(),
                    config.read_timeout,
                    self.core.transfer.clone(),
                ));
                self.select(source, TransportProtocol::Rtp)
            }
        }
    }

    fn select(
        &self,
        source: Box<dyn MediaSource>,
        protocol: TransportProtocol,
    ) -> Result<ExtractorDriver> {
        let mut input = MediaInput::new(source);
        let extractor = match select_extractor(
            self.core.extractors.as_ref(),
            protocol,
            &self.core.track.payload,
            self.core.track_ids.clone(),
        ) {
            Some(extractor) => extractor,
            None => sniff_raw(self.core.extractors.as_ref(), &mut input)?,
        };
        Ok(ExtractorDriver::new(extractor, input))
    }

    fn register_udp_rtcp_sink(&self, endpoint: &Arc<UdpEndpoint>) {
        let transport = self.core.current_transport();
        if transport.server_ports.len() < 2 {
            return;
        }
        let host = crate::transport::punch_host(
            &transport,
            self.core.track.url_host().unwrap_or_default(),
        )
        .to_string();
        let sink: Arc<dyn RtcpListener> = Arc::new(UdpRtcpSink::new(
            endpoint.clone(),
            host,
            transport.server_ports[1],
        ));
        self.core.rtcp_out.add_listener(sink.clone());
        *self.rtcp_sink.lock() = Some(sink);
    }

    fn load_media(&self, driver: &mut ExtractorDriver) -> Result<()> {
        let mut action = ReadAction::Continue;
        while action == ReadAction::Continue && !self.canceled.load(Ordering::SeqCst) {
            while action == ReadAction::Continue
                && !self.canceled.load(Ordering::SeqCst)
                && !self.pending_reset.load(Ordering::SeqCst)
            {
                match driver.read() {
                    Ok(next) => action = next,
                    Err(StreamError::ReadTimeout(timeout)) => {
                        // Quiet periods are expected while paused, and the
                        // interleaved source only wakes to poll for
                        // cancellation.
                        if self.core.session.is_paused() || self.mode == LoadableMode::Interleaved
                        {
                            continue;
                        }
                        return Err(StreamError::ReadTimeout(timeout));
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.pending_reset.swap(false, Ordering::SeqCst) {
                if let Some(position_us) = self.core.take_pending_reset_position() {
                    tracing::debug!(position_us, "servicing pending reset");
                    driver.seek(position_us);
                }
            }
        }
        Ok(())
    }

    fn maybe_finish_open(&self) {
        if self.canceled.load(Ordering::SeqCst) || self.opened.load(Ordering::SeqCst) {
            return;
        }
        self.opened.store(true, Ordering::SeqCst);
        self.core.post_prepare_started();
    }

    fn maybe_failure_open(&self, error: &StreamError) {
        if self.canceled.load(Ordering::SeqCst) && !self.released.load(Ordering::SeqCst) {
            // Ordinary cancellation: the loader callback handles it.
            return;
        }
        if self.open_failed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.opened.store(false, Ordering::SeqCst);
        self.core.post_prepare_failure(error.clone());
    }

    /// Close the transport and let any blocked waiter through. Invoked
    /// from both the load thread (end of `load`) and `release`.
    fn close_internal(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(endpoint) = self.udp_endpoint.lock().as_ref() {
            endpoint.close();
        }
        if let Some(sink) = self.rtcp_sink.lock().take() {
            self.core.rtcp_out.remove_listener(&sink);
        }
        self.opened.store(false, Ordering::SeqCst);
        // A successor loadable (transport failover) must not stay parked
        // on the gate this loadable was admitted through.
        self.core.load_condition.open();
    }
}

impl Loadable for MediaLoadable {
    fn load(&self) -> Result<()> {
        let result = self.run();
        self.close_internal();
        result
    }

    fn cancel_load(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        // Unblock a loadable parked between open and playback.
        self.core.load_condition.open();
    }
}
