//! ELM327 adapter controller.
//!
//! Drives the adapter's line-oriented AT command set over any
//! [`ByteTransport`]: issues the configuration sequence, sends OBD-II and
//! UDS requests, reassembles the multi-frame ISO-TP replies, and optionally
//! keeps the ECU's diagnostic session alive with a cyclic Tester Present
//! worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::isotp::parse_isotp_frames;
use crate::transport::ByteTransport;
use crate::uds::UdsResponse;

/// Prompt character terminating every adapter reply.
const PROMPT: &[u8] = b">";

/// Settling delay after each command on hardware transports.
const COMMAND_DELAY: Duration = Duration::from_millis(100);

/// Longer settling delay while the adapter reboots after `ATZ`.
const RESET_DELAY: Duration = Duration::from_secs(1);

/// Sleep granularity of the tester-present worker, kept short so disabling
/// it joins promptly.
const TICKER_STEP: Duration = Duration::from_millis(50);

/// Status and error tokens the adapter emits instead of frame data.
const ERROR_TOKENS: [&str; 9] = [
    "NO DATA",
    "ERROR",
    "?",
    "STOPPED",
    "UNABLE TO CONNECT",
    "BUS INIT",
    "CAN ERROR",
    "BUFFER FULL",
    "<DATA ERROR",
];

/// Informational tokens stripped from replies before frame extraction.
const INFO_TOKENS: [&str; 4] = ["SEARCHING...", "BUSINIT:", "BUSINIT...", "OK"];

/// Length of the CAN id prefix on each reply line once `ATH1` is active.
const CAN_ID_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Fresh,
    Initializing,
    Ready,
    Closed,
}

struct TesterPresent {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Driver for ELM327-based OBD-II adapters.
///
/// The controller serializes all adapter traffic: at most one request is in
/// flight, and the tester-present worker shares the transport through the
/// same mutex. Use one controller per adapter.
pub struct Elm327<T: ByteTransport> {
    transport: Arc<Mutex<T>>,
    state: SessionState,
    tester_present: Option<TesterPresent>,
}

impl<T: ByteTransport + 'static> Elm327<T> {
    /// Wrap an already opened transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            state: SessionState::Fresh,
            tester_present: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn tester_present_active(&self) -> bool {
        self.tester_present
            .as_ref()
            .map_or(false, |tp| tp.running.load(Ordering::SeqCst))
    }

    /// Configure the adapter for OBD-II/UDS traffic and mark the session
    /// ready. Safe to call again on an already initialized controller.
    pub fn initialize(&mut self) -> Result<()> {
        self.state = SessionState::Initializing;
        match self.run_init_sequence() {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!("ELM327 initialized");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Fresh;
                Err(Error::AdapterInit(Box::new(e)))
            }
        }
    }

    fn run_init_sequence(&mut self) -> Result<()> {
        self.send_command("ATZ")?;
        if self.needs_delays() {
            thread::sleep(RESET_DELAY);
        }
        self.send_command("ATE0")?; // echo off
        self.send_command("ATL0")?; // linefeeds off
        self.send_command("ATS0")?; // spaces off
        self.send_command("ATH1")?; // headers on
        self.send_command("ATSP0")?; // automatic protocol selection
        Ok(())
    }

    /// Send an OBD-II or UDS request and return the structured response.
    ///
    /// With a CAN id the request is addressed via `ATSH` and `request` is
    /// taken as a packed UDS request (e.g. `0x220101`). Without one it is a
    /// standard OBD-II Mode 01 query and `request` is the PID.
    pub fn send_message(&mut self, can_id: Option<u16>, request: u32) -> Result<UdsResponse> {
        if self.state != SessionState::Ready {
            return Err(Error::NotReady);
        }

        let message = match can_id {
            Some(id) => {
                self.send_request_line(&format!("ATSH{id:03X}"))?;
                format!("{request:02X}")
            }
            None => format!("01{request:02X}"),
        };

        let reply = self.send_request_line(&message)?;
        let payload = parse_reply(&reply)?;
        UdsResponse::decode(&payload)
    }

    /// Start the cyclic Tester Present (0x3E) keep-alive. Idempotent while
    /// a worker is running.
    ///
    /// The worker only writes; whatever the adapter answers is swallowed by
    /// the next request's read-to-prompt.
    pub fn enable_cyclic_tester_present(&mut self, interval: Duration) {
        if self.tester_present_active() {
            return;
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let transport = Arc::clone(&self.transport);
        let handle = thread::spawn(move || {
            while flag.load(Ordering::SeqCst) {
                {
                    let mut transport = transport.lock().unwrap_or_else(PoisonError::into_inner);
                    // Suppress-positive-response variant of Tester Present.
                    if let Err(e) = transport.write(b"3E00\r") {
                        warn!("Tester present write failed: {e}");
                    }
                }
                let mut slept = Duration::ZERO;
                while slept < interval && flag.load(Ordering::SeqCst) {
                    let step = TICKER_STEP.min(interval - slept);
                    thread::sleep(step);
                    slept += step;
                }
            }
        });

        info!("Cyclic tester present enabled, interval {interval:?}");
        self.tester_present = Some(TesterPresent { running, handle });
    }

    /// Stop the keep-alive worker and wait for it to exit.
    pub fn disable_tester_present(&mut self) {
        if let Some(tp) = self.tester_present.take() {
            tp.running.store(false, Ordering::SeqCst);
            if tp.handle.join().is_err() {
                warn!("Tester present worker panicked");
            }
        }
    }

    /// Stop background work and release the transport.
    pub fn close(&mut self) -> Result<()> {
        self.disable_tester_present();
        let result = self.transport().close();
        self.state = SessionState::Closed;
        result
    }

    /// Send one command line and read the reply through the prompt.
    ///
    /// The transport stays locked for the whole exchange so tester-present
    /// writes cannot land between the command and its reply.
    fn send_command(&mut self, command: &str) -> Result<String> {
        debug!("TX: {command}");
        let mut transport = self.transport();
        transport.write(format!("{command}\r").as_bytes())?;
        if transport.needs_delays() {
            thread::sleep(COMMAND_DELAY);
        }
        let raw = transport.read_until(PROMPT, None)?;
        let reply = String::from_utf8_lossy(&raw).trim().to_string();
        debug!("RX: {reply}");
        Ok(reply)
    }

    fn send_request_line(&mut self, line: &str) -> Result<String> {
        self.send_command(line).map_err(|e| match e {
            Error::TransportTimeout(msg) => {
                Error::NoResponse(format!("timed out waiting for prompt: {msg}"))
            }
            other => other,
        })
    }

    fn transport(&self) -> MutexGuard<'_, T> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn needs_delays(&self) -> bool {
        self.transport().needs_delays()
    }
}

/// Extract the UDS payload from an adapter reply: strip informational
/// tokens, classify status tokens, drop the CAN id from each line, and
/// reassemble the ISO-TP frames.
fn parse_reply(reply: &str) -> Result<Vec<u8>> {
    let mut cleaned = reply.replace('>', "");
    for token in INFO_TOKENS {
        cleaned = cleaned.replace(token, "");
    }

    for token in ERROR_TOKENS {
        if cleaned.contains(token) {
            return Err(Error::NoResponse(format!(
                "adapter reported {token:?} in reply {reply:?}"
            )));
        }
    }

    // CR is the primary line separator; fall back to LF for adapters that
    // only emit linefeeds.
    let normalized = cleaned.replace("\r\r", "\r").replace("\n\n", "\n");
    let mut lines: Vec<&str> = normalized.split('\r').collect();
    if lines.len() <= 1 {
        lines = normalized.split('\n').collect();
    }

    let mut frames: Vec<String> = Vec::new();
    for line in lines {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() < CAN_ID_LEN {
            continue;
        }
        let (can_id, frame_data) = compact.split_at(CAN_ID_LEN);
        if !can_id.chars().all(|c| c.is_ascii_hexdigit()) {
            // Not a CAN frame line.
            continue;
        }
        if frame_data.len() >= 2 {
            frames.push(frame_data.to_string());
        }
    }

    if frames.is_empty() {
        // Headerless reply; treat the whole thing as one hex blob.
        let blob: String = cleaned.chars().filter(|c| !c.is_whitespace()).collect();
        return hex::decode(&blob)
            .map_err(|e| Error::ResponseMalformed(format!("unparseable reply {reply:?}: {e}")));
    }

    parse_isotp_frames(&frames)
        .map_err(|e| Error::ResponseMalformed(format!("ISO-TP reassembly failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn ready_controller() -> (Elm327<MockTransport>, MockTransport) {
        let mut mock = MockTransport::with_recorded_trace();
        mock.open().expect("mock open cannot fail");
        let handle = mock.clone();
        let mut elm = Elm327::new(mock);
        elm.initialize().expect("init against the scripted trace");
        (elm, handle)
    }

    #[test]
    fn initialization_sends_the_at_sequence_in_order() {
        let (elm, mock) = ready_controller();
        assert!(elm.is_ready());
        assert_eq!(
            mock.write_log(),
            vec!["ATZ", "ATE0", "ATL0", "ATS0", "ATH1", "ATSP0"]
        );
    }

    #[test]
    fn send_message_before_initialize_is_rejected() {
        let mut elm = Elm327::new(MockTransport::with_recorded_trace());
        assert!(matches!(
            elm.send_message(Some(0x7E4), 0x220101),
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn uds_request_addresses_the_can_id_first() {
        let (mut elm, mock) = ready_controller();
        elm.send_message(Some(0x7E4), 0x220101).unwrap();
        let log = mock.write_log();
        assert_eq!(&log[log.len() - 2..], &["ATSH7E4", "220101"]);
    }

    #[test]
    fn multi_frame_uds_response_is_reassembled() {
        let (mut elm, _mock) = ready_controller();
        let response = elm.send_message(Some(0x7E4), 0x220102).unwrap();
        assert_eq!(response.service_id, 0x62);
        assert_eq!(response.data_identifier, Some(0x0102));
        assert_eq!(response.payload.len(), 36);
        assert_eq!(&response.payload[..4], &[0xFF; 4]);
        assert!(response.payload[4..].iter().all(|&b| b == 0xBC));
    }

    #[test]
    fn recorded_battery_trace_decodes() {
        let (mut elm, _mock) = ready_controller();
        let response = elm.send_message(Some(0x7E4), 0x220101).unwrap();
        assert_eq!(response.service_id, 0x62);
        assert_eq!(response.data_identifier, Some(0x0101));
        assert_eq!(response.payload.len(), 0x3E - 3);
    }

    #[test]
    fn obd_query_without_can_id_uses_mode_01() {
        let (mut elm, mock) = ready_controller();
        mock.script("010C", "7E8 04 41 0C 1A F8 \r\r>");
        let response = elm.send_message(None, 0x0C).unwrap();
        assert_eq!(mock.calls("010C"), 1);
        assert_eq!(response.service_id, 0x41);
        assert_eq!(response.data_identifier, None);
        assert_eq!(response.payload, vec![0x0C, 0x1A, 0xF8]);
    }

    #[test]
    fn stopped_reply_is_classified_as_no_response() {
        let (mut elm, mock) = ready_controller();
        mock.script("220101", "SEARCHING...\rSTOPPED\r\r>");
        let err = elm.send_message(Some(0x7E4), 0x220101).unwrap_err();
        assert!(matches!(err, Error::NoResponse(_)));
    }

    #[test]
    fn unknown_command_reply_is_classified_as_no_response() {
        let (mut elm, _mock) = ready_controller();
        // 221234 is not scripted, so the mock answers with "?".
        let err = elm.send_message(Some(0x7E4), 0x221234).unwrap_err();
        assert!(matches!(err, Error::NoResponse(_)));
    }

    #[test]
    fn no_data_reply_is_classified_as_no_response() {
        let (mut elm, mock) = ready_controller();
        mock.script("0100", "NO DATA\r\r>");
        let err = elm.send_message(None, 0x00).unwrap_err();
        assert!(matches!(err, Error::NoResponse(_)));
    }

    #[test]
    fn headerless_reply_falls_back_to_raw_hex() {
        let (mut elm, mock) = ready_controller();
        // Too short for a CAN id prefix, so the raw-blob path kicks in.
        mock.script("0105", "7B\r\r>");
        let response = elm.send_message(None, 0x05).unwrap();
        assert_eq!(response.service_id, 0x7B);
        assert!(response.payload.is_empty());
    }

    #[test]
    fn unparseable_reply_is_malformed() {
        let (mut elm, mock) = ready_controller();
        mock.script("0105", "ZZ\r\r>");
        let err = elm.send_message(None, 0x05).unwrap_err();
        assert!(matches!(err, Error::ResponseMalformed(_)));
    }

    #[test]
    fn isotp_violations_surface_as_malformed_response() {
        let (mut elm, mock) = ready_controller();
        // Second consecutive frame jumps the sequence from 1 to 2.
        mock.script(
            "220103",
            "7EC 10 10 62 01 03 FF FF FF \r7EC 22 BC BC BC BC BC BC BC \r\r>",
        );
        let err = elm.send_message(Some(0x7E4), 0x220103).unwrap_err();
        assert!(matches!(err, Error::ResponseMalformed(_)));
    }

    #[test]
    fn tester_present_ticks_until_disabled() {
        let (mut elm, mock) = ready_controller();
        elm.enable_cyclic_tester_present(Duration::from_millis(100));
        assert!(elm.tester_present_active());
        thread::sleep(Duration::from_millis(350));
        elm.disable_tester_present();
        assert!(!elm.tester_present_active());
        assert!(
            mock.calls("3E00") >= 3,
            "expected at least 3 keep-alive writes, saw {}",
            mock.calls("3E00")
        );
    }

    #[test]
    fn enabling_tester_present_twice_keeps_one_worker() {
        let (mut elm, mock) = ready_controller();
        elm.enable_cyclic_tester_present(Duration::from_secs(5));
        elm.enable_cyclic_tester_present(Duration::from_secs(5));
        // Give the single worker time for its first write of the 5 s cycle.
        thread::sleep(Duration::from_millis(150));
        elm.disable_tester_present();
        assert_eq!(mock.calls("3E00"), 1);
    }

    #[test]
    fn close_stops_the_ticker_and_transport() {
        let (mut elm, mock) = ready_controller();
        elm.enable_cyclic_tester_present(Duration::from_millis(50));
        elm.close().unwrap();
        assert!(!elm.tester_present_active());
        assert!(!mock.is_open());
        assert!(matches!(
            elm.send_message(None, 0x0C),
            Err(Error::NotReady)
        ));
    }

    struct DeadTransport;

    impl ByteTransport for DeadTransport {
        fn open(&mut self) -> Result<()> {
            Err(Error::TransportOpen("nothing listening".into()))
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, _data: &[u8]) -> Result<()> {
            Err(Error::TransportWrite("wire is gone".into()))
        }
        fn read(&mut self, _size: usize) -> Result<Vec<u8>> {
            Err(Error::TransportRead("wire is gone".into()))
        }
        fn read_until(&mut self, _terminator: &[u8], _timeout: Option<Duration>) -> Result<Vec<u8>> {
            Err(Error::TransportRead("wire is gone".into()))
        }
        fn flush_input(&mut self) -> Result<()> {
            Ok(())
        }
        fn flush_output(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            false
        }
        fn needs_delays(&self) -> bool {
            false
        }
    }

    #[test]
    fn initialize_failure_is_wrapped() {
        let mut elm = Elm327::new(DeadTransport);
        let err = elm.initialize().unwrap_err();
        assert!(matches!(err, Error::AdapterInit(_)));
        assert!(!elm.is_ready());
    }

    /// Replies to the init sequence, then never produces another prompt.
    struct SilentAfterInit {
        commands: usize,
    }

    impl ByteTransport for SilentAfterInit {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, _data: &[u8]) -> Result<()> {
            self.commands += 1;
            Ok(())
        }
        fn read(&mut self, _size: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn read_until(&mut self, _terminator: &[u8], _timeout: Option<Duration>) -> Result<Vec<u8>> {
            if self.commands <= 6 {
                Ok(b"OK\r\r>".to_vec())
            } else {
                Err(Error::TransportTimeout("no prompt seen".into()))
            }
        }
        fn flush_input(&mut self) -> Result<()> {
            Ok(())
        }
        fn flush_output(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn needs_delays(&self) -> bool {
            false
        }
    }

    #[test]
    fn prompt_timeout_surfaces_as_no_response() {
        let mut elm = Elm327::new(SilentAfterInit { commands: 0 });
        elm.initialize().unwrap();
        let err = elm.send_message(None, 0x0C).unwrap_err();
        assert!(matches!(err, Error::NoResponse(_)));
    }
}
