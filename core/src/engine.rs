//! The ARQ engine: a pure, non-I/O protocol state machine. See spec.md §4.1.

use std::collections::VecDeque;

use tracing::trace;

use crate::config::{
    NoDelayConfig, DEFAULT_DEAD_LINK, DEFAULT_INTERVAL, DEFAULT_MTU, DEFAULT_RCV_WND,
    DEFAULT_RMT_WND, DEFAULT_RTO, DEFAULT_SND_WND, DEFAULT_SSTHRESH, MIN_MTU, PROBE_INIT_WAIT,
    PROBE_MAX_WAIT,
};
use crate::error::EngineError;
use crate::modular_cmp::{mod_ge, mod_geq, mod_le, mod_leq};
use crate::rtt::RttEstimator;
use crate::segment::{decode_all, Command, Segment, HEADER_SIZE};

const RTO_NDL: u32 = 30;
const RTO_MIN: u32 = 100;
const SSTHRESH_MIN: u32 = 2;

/// The outcome of feeding a datagram's worth of bytes into [`Engine::input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// The whole buffer was dropped (conversation id mismatch).
    ConvMismatch,
    /// Processed; a new contiguous message is now available at the head of
    /// the receive queue.
    NewData,
    /// Processed; nothing new is deliverable yet.
    NoNewData,
}

/// A pure, non-I/O reliable-ARQ protocol state machine for one conversation.
///
/// The engine owns no socket and spawns no tasks: all network I/O, timer
/// scheduling, and thread coordination live in the session driver that wraps
/// it. Every wire byte the engine wants to send is handed to the `output`
/// sink supplied at construction.
pub struct Engine {
    conv: u32,
    mtu: usize,
    mss: usize,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,

    cwnd: u32,
    ssthresh: u32,
    incr: usize,
    nocwnd: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    rtt: RttEstimator,

    current: u32,
    ts_flush: Option<u32>,
    ts_probe: u32,
    probe_wait: u32,
    probe_should_ask: bool,
    probe_should_tell: bool,

    nodelay: bool,
    fastresend: u32,
    interval: u32,
    dead_link: u32,
    dead: bool,
    xmit_total: u32,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: VecDeque<(u32, u32)>,

    output: Box<dyn FnMut(&[u8]) + Send>,
}

impl Engine {
    /// Creates a new engine for conversation `conv`. `output` is invoked
    /// with a contiguous, ready-to-wire buffer each time the flush loop
    /// fills one up to `mtu`.
    pub fn new(conv: u32, output: impl FnMut(&[u8]) + Send + 'static) -> Self {
        Self {
            conv,
            mtu: DEFAULT_MTU,
            mss: DEFAULT_MTU - HEADER_SIZE,

            snd_wnd: DEFAULT_SND_WND,
            rcv_wnd: DEFAULT_RCV_WND,
            rmt_wnd: DEFAULT_RMT_WND,

            cwnd: 1,
            ssthresh: DEFAULT_SSTHRESH,
            incr: 0,
            nocwnd: false,

            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,

            rtt: RttEstimator::new(DEFAULT_RTO, RTO_MIN),

            current: 0,
            ts_flush: None,
            ts_probe: 0,
            probe_wait: 0,
            probe_should_ask: false,
            probe_should_tell: false,

            nodelay: false,
            fastresend: 0,
            interval: DEFAULT_INTERVAL,
            dead_link: DEFAULT_DEAD_LINK,
            dead: false,
            xmit_total: 0,

            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: VecDeque::new(),

            output: Box::new(output),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Segments in flight or queued, used by the stream wrapper to size
    /// write chunks (`mss * min(snd_wnd, 255)`).
    pub fn snd_wnd(&self) -> u16 {
        self.snd_wnd
    }

    pub fn rto(&self) -> u32 {
        self.rtt.rto()
    }

    // ---- configuration knobs (spec.md §4.1 "Configuration knobs") ----

    pub fn set_nodelay(&mut self, cfg: NoDelayConfig) {
        self.nodelay = cfg.nodelay;
        self.rtt.set_minrto(if cfg.nodelay { RTO_NDL } else { RTO_MIN });
        self.interval = cfg.interval.clamp(10, 5000);
        self.fastresend = cfg.fastresend;
        self.nocwnd = cfg.nocwnd;
    }

    pub fn set_wnd_size(&mut self, snd: u16, rcv: u16) {
        if snd > 0 {
            self.snd_wnd = snd;
        }
        if rcv > 0 {
            self.rcv_wnd = rcv;
        }
    }

    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), EngineError> {
        if mtu < MIN_MTU {
            return Err(EngineError::MtuTooSmall(mtu));
        }
        self.mtu = mtu;
        self.mss = mtu - HEADER_SIZE;
        Ok(())
    }

    pub fn set_dead_link(&mut self, retries: u32) {
        self.dead_link = retries;
    }

    // ---- data path ----

    /// Fragments `data` into at most `ceil(len / mss)` segments and appends
    /// them to the send queue. See spec.md §4.1 "Send".
    pub fn send(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if data.is_empty() {
            self.snd_queue.push_back(Segment::new(self.conv, Command::Push, Vec::new()));
            return Ok(());
        }

        let count = data.len().div_ceil(self.mss);
        if count > 255 {
            return Err(EngineError::MessageTooLarge(data.len()));
        }

        for (i, chunk) in data.chunks(self.mss).enumerate() {
            let frg = (count - 1 - i) as u8;
            let mut seg = Segment::new(self.conv, Command::Push, chunk.to_vec());
            seg.frg = frg;
            self.snd_queue.push_back(seg);
        }
        Ok(())
    }

    /// The byte length of the next deliverable message, or `None` if the
    /// head of the receive queue is not yet a complete fragment chain.
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.data.len());
        }
        if self.rcv_queue.len() < first.frg as usize + 1 {
            return None;
        }
        let mut total = 0;
        for seg in &self.rcv_queue {
            total += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(total)
    }

    /// Copies the next complete message into `out` (cleared first),
    /// returning its length. See spec.md §4.1 "Recv".
    pub fn recv(&mut self, out: &mut Vec<u8>) -> Result<usize, EngineError> {
        let needed = self.peek_size().ok_or(EngineError::QueueEmpty)?;
        let was_full = self.rcv_queue.len() >= self.rcv_wnd as usize;

        out.clear();
        loop {
            let seg = self.rcv_queue.pop_front().expect("peek_size guarantees a complete chain");
            let last = seg.frg == 0;
            out.extend_from_slice(&seg.data);
            if last {
                break;
            }
        }
        debug_assert_eq!(out.len(), needed);

        self.migrate_rcv_buf();

        if was_full && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe_should_tell = true;
        }

        Ok(needed)
    }

    /// Moves the contiguous prefix of `rcv_buf` starting at `rcv_nxt` into
    /// `rcv_queue`, bounded by `rcv_wnd`.
    fn migrate_rcv_buf(&mut self) {
        while self.rcv_queue.len() < self.rcv_wnd as usize {
            match self.rcv_buf.front() {
                Some(seg) if seg.sn == self.rcv_nxt => {
                    let seg = self.rcv_buf.pop_front().unwrap();
                    self.rcv_queue.push_back(seg);
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                }
                _ => break,
            }
        }
    }

    /// Feeds a datagram's worth of concatenated segments into the engine.
    /// See spec.md §4.1 "Input".
    pub fn input(&mut self, buf: &[u8]) -> InputOutcome {
        let segments = decode_all(buf);
        if let Some(first) = segments.front() {
            if first.conv != self.conv {
                return InputOutcome::ConvMismatch;
            }
        } else {
            return InputOutcome::NoNewData;
        }

        let old_una = self.snd_una;

        for seg in &segments {
            self.rmt_wnd = seg.wnd;
            self.apply_una(seg.una);

            match seg.cmd {
                Command::Ack => {
                    if mod_leq(seg.ts, self.current) {
                        self.rtt.sample((self.current.wrapping_sub(seg.ts)) as i32, self.interval);
                    }
                    self.remove_acked(seg.sn);
                    self.apply_una(self.snd_buf.front().map(|s| s.sn).unwrap_or(self.snd_nxt));
                    self.bump_fast_resend_counters(seg.sn);
                }
                Command::Push => {
                    if mod_le(seg.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32))
                        && mod_geq(seg.sn, self.rcv_nxt)
                    {
                        self.acklist.push_back((seg.sn, seg.ts));
                        self.insert_rcv_buf(seg.clone());
                    }
                }
                Command::WindowAsk => {
                    self.probe_should_tell = true;
                }
                Command::WindowInsist => {}
            }
        }

        self.migrate_rcv_buf();

        if mod_ge(self.snd_una, old_una) && self.snd_una != old_una {
            self.grow_congestion_window();
        }

        if self.peek_size().is_some() {
            InputOutcome::NewData
        } else {
            InputOutcome::NoNewData
        }
    }

    fn apply_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if mod_le(seg.sn, una) {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
        if mod_ge(una, self.snd_una) {
            self.snd_una = una;
        }
    }

    fn remove_acked(&mut self, sn: u32) {
        if mod_le(sn, self.snd_una.wrapping_sub(1)) || mod_ge(sn, self.snd_nxt) {
            return;
        }
        if let Some(pos) = self.snd_buf.iter().position(|s| s.sn == sn) {
            self.snd_buf.remove(pos);
        }
    }

    /// For every segment still in flight with `sn` behind the acked one,
    /// bump its skip counter (the fast-retransmit signal).
    fn bump_fast_resend_counters(&mut self, acked_sn: u32) {
        for seg in &mut self.snd_buf {
            if mod_le(seg.sn, acked_sn) && seg.sn != acked_sn {
                seg.skip += 1;
            }
        }
    }

    fn insert_rcv_buf(&mut self, seg: Segment) {
        let mut insert_at = self.rcv_buf.len();
        for existing in self.rcv_buf.iter().rev() {
            if existing.sn == seg.sn {
                return; // duplicate
            }
            if mod_le(existing.sn, seg.sn) {
                break;
            }
            insert_at -= 1;
        }
        self.rcv_buf.insert(insert_at, seg);
    }

    fn grow_congestion_window(&mut self) {
        if self.nocwnd {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += self.mss;
        } else {
            let incr = self.incr.max(self.mss);
            let incr = incr + (self.mss * self.mss) / incr + self.mss / 16;
            self.incr = incr;
            if ((self.cwnd as usize) + 1) * self.mss <= incr {
                self.cwnd = ((incr + self.mss - 1) / self.mss.max(1)) as u32;
            }
        }
        if self.cwnd > self.rmt_wnd as u32 {
            self.cwnd = self.rmt_wnd as u32;
            self.incr = self.rmt_wnd as usize * self.mss;
        }
    }

    // ---- timer-driven path ----

    /// Advances the engine's notion of wall-clock time and flushes if an
    /// interval boundary (or a resynchronization point, for a clock jump of
    /// more than 10s) has been crossed. See spec.md §4.1 "Update".
    pub fn update(&mut self, current_ms: u32) {
        self.current = current_ms;

        let ts_flush = *self.ts_flush.get_or_insert(current_ms);
        let elapsed = current_ms.wrapping_sub(ts_flush) as i32;

        if !(-10_000..10_000).contains(&elapsed) {
            self.ts_flush = Some(current_ms);
        }

        if current_ms.wrapping_sub(self.ts_flush.unwrap()) as i32 >= 0 {
            self.flush();
            let mut next = self.ts_flush.unwrap() + self.interval;
            if mod_leq(next, self.current) {
                next = self.current + self.interval;
            }
            self.ts_flush = Some(next);
        }
    }

    /// The earliest wall-clock time at which `update` would do meaningful
    /// work. See spec.md §4.1 "Check".
    pub fn check(&self, current_ms: u32) -> u32 {
        let Some(ts_flush) = self.ts_flush else {
            return current_ms;
        };

        let mut ts_flush = ts_flush;
        let elapsed = current_ms.wrapping_sub(ts_flush) as i32;
        if !(-10_000..10_000).contains(&elapsed) {
            ts_flush = current_ms;
        }
        if mod_geq(current_ms, ts_flush) {
            return current_ms;
        }

        let mut earliest = ts_flush;
        for seg in &self.snd_buf {
            if mod_leq(earliest, seg.resendts) {
                // keep earliest
            } else {
                earliest = seg.resendts;
            }
            if mod_leq(seg.resendts, current_ms) {
                return current_ms;
            }
        }
        earliest
    }

    fn unused_wnd(&self) -> u16 {
        self.rcv_wnd.saturating_sub(self.rcv_queue.len() as u16)
    }

    /// Builds outbound segments into a single contiguous buffer, handing it
    /// to the output sink whenever appending another segment would exceed
    /// `mtu`. See spec.md §4.1 "Flush".
    fn flush(&mut self) {
        let mut buf = Vec::with_capacity(self.mtu);
        let wnd = self.unused_wnd();
        let una = self.rcv_nxt;

        // 1. queued ACKs
        let acks = std::mem::take(&mut self.acklist);
        for (sn, ts) in acks {
            let mut seg = Segment::new(self.conv, Command::Ack, Vec::new());
            seg.sn = sn;
            seg.ts = ts;
            seg.wnd = wnd;
            seg.una = una;
            self.emit_segment(&mut buf, &seg);
        }

        // 2. window probe maintenance
        self.maintain_probe_timer();
        if self.probe_should_ask {
            let mut seg = Segment::new(self.conv, Command::WindowAsk, Vec::new());
            seg.wnd = wnd;
            seg.una = una;
            self.emit_segment(&mut buf, &seg);
            self.probe_should_ask = false;
        }
        if self.probe_should_tell {
            let mut seg = Segment::new(self.conv, Command::WindowInsist, Vec::new());
            seg.wnd = wnd;
            seg.una = una;
            self.emit_segment(&mut buf, &seg);
            self.probe_should_tell = false;
        }

        // 3. effective transmit window
        let mut cwnd_eff = std::cmp::min(self.snd_wnd, self.rmt_wnd) as u32;
        if !self.nocwnd {
            cwnd_eff = std::cmp::min(cwnd_eff, self.cwnd);
        }

        // 4. admit queued segments into the send buffer
        while mod_le(self.snd_nxt, self.snd_una.wrapping_add(cwnd_eff)) && self.snd_nxt != self.snd_una.wrapping_add(cwnd_eff) {
            let Some(mut seg) = self.snd_queue.pop_front() else { break };
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            seg.una = una;
            seg.ts = self.current;
            seg.resendts = self.current;
            seg.rto = self.rtt.rto();
            self.snd_buf.push_back(seg);
        }

        // 5. (re)transmit segments in the send buffer
        let resend_threshold = if self.fastresend > 0 { self.fastresend } else { u32::MAX };
        let rtomin = if !self.nodelay { self.rtt.rto() >> 3 } else { 0 };

        let mut lost = false;
        let mut fast_retransmits = 0u32;
        let mut became_dead = false;

        for seg in &mut self.snd_buf {
            let mut send_now = false;

            if seg.xmit == 0 {
                send_now = true;
                seg.rto = self.rtt.rto();
                seg.resendts = self.current + seg.rto + rtomin;
            } else if mod_geq(self.current, seg.resendts) {
                send_now = true;
                if self.nodelay {
                    seg.rto += seg.rto / 2;
                } else {
                    seg.rto += std::cmp::max(seg.rto, self.rtt.rto());
                }
                seg.resendts = self.current + seg.rto;
                lost = true;
            } else if seg.skip >= resend_threshold {
                send_now = true;
                seg.skip = 0;
                seg.resendts = self.current + seg.rto;
                fast_retransmits += 1;
            }

            if send_now {
                seg.ts = self.current;
                seg.wnd = wnd;
                seg.una = una;
                seg.xmit += 1;
                self.xmit_total += 1;

                let mut encoded = Vec::with_capacity(seg.encoded_len());
                seg.encode(&mut encoded);
                if buf.len() + encoded.len() > self.mtu && !buf.is_empty() {
                    (self.output)(&buf);
                    buf.clear();
                }
                buf.extend_from_slice(&encoded);

                if seg.xmit >= self.dead_link {
                    became_dead = true;
                }
            }
        }

        if !buf.is_empty() {
            (self.output)(&buf);
        }

        if became_dead && !self.dead {
            self.dead = true;
            trace!(conv = self.conv, "engine transitioned to dead: xmit reached dead_link");
        }

        // 6. congestion response
        if fast_retransmits > 0 {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = std::cmp::max(inflight / 2, SSTHRESH_MIN);
            self.cwnd = self.ssthresh + self.fastresend;
            self.incr = self.cwnd as usize * self.mss;
        }
        if lost {
            self.ssthresh = std::cmp::max(cwnd_eff / 2, SSTHRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
        }
    }

    fn maintain_probe_timer(&mut self) {
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT_WAIT;
                self.ts_probe = self.current + self.probe_wait;
            } else if mod_geq(self.current, self.ts_probe) {
                self.probe_wait = std::cmp::max(self.probe_wait, PROBE_INIT_WAIT);
                self.probe_wait = std::cmp::min(self.probe_wait + self.probe_wait / 2, PROBE_MAX_WAIT);
                self.ts_probe = self.current + self.probe_wait;
                self.probe_should_ask = true;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }
    }

    fn emit_segment(&mut self, buf: &mut Vec<u8>, seg: &Segment) {
        let mut encoded = Vec::with_capacity(seg.encoded_len());
        seg.encode(&mut encoded);
        if buf.len() + encoded.len() > self.mtu && !buf.is_empty() {
            (self.output)(buf);
            buf.clear();
        }
        buf.extend_from_slice(&encoded);
    }
}
