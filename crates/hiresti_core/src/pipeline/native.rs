//! Native codec backend: symphonia demux/decode into an rtrb ring, drained
//! by a cpal output callback that runs the software stage.
//!
//! ```text
//! hiresti-decode                         cpal callback
//! ──────────────                         ─────────────
//! FormatReader ─► Decoder ─► stereo ─►  Consumer<f32> ─► ProcessorChain ─► device
//!                            resample?        ▲
//!                                  Producer<f32>
//! ```
//!
//! A decode session is tied to one output configuration. Seeking and
//! reconfiguring both start a new session at the requested position.
//!
//! Remote streams are read through an `hiresti-http` fetch thread that
//! hands body chunks to the demuxer over a bounded channel. They are not
//! seekable; a seek restarts them from the top.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig, StreamError};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, info, warn};

use hiresti_dsp::ProcessorChain;
use hiresti_platform::Driver;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{SinkFormat, StreamFormat};
use crate::pipeline::backend::{BackendEvent, CodecBackend, LoadedMedia};
use crate::pipeline::graph::{GraphPlan, SoftwareStage};

const OUTPUT_CHANNELS: usize = 2;
const MIN_RING_SAMPLES: usize = 8192;
const HTTP_CHUNK_BYTES: usize = 64 * 1024;
const HTTP_QUEUED_CHUNKS: usize = 16;

struct Probed {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: StreamFormat,
    duration_s: Option<f64>,
}

impl std::fmt::Debug for Probed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probed")
            .field("track_id", &self.track_id)
            .field("format", &self.format)
            .field("duration_s", &self.duration_s)
            .finish_non_exhaustive()
    }
}

/// Where a track's bytes come from
#[derive(Debug, Clone, PartialEq)]
enum MediaLocation {
    File(PathBuf),
    Http(String),
}

impl MediaLocation {
    fn parse(uri: &str) -> Self {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            MediaLocation::Http(uri.to_string())
        } else {
            MediaLocation::File(PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri)))
        }
    }

    fn extension(&self) -> Option<String> {
        match self {
            MediaLocation::File(path) => path.extension().and_then(|e| e.to_str()).map(str::to_string),
            MediaLocation::Http(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                let name = path.rsplit('/').next()?;
                let (_, ext) = name.rsplit_once('.')?;
                (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            MediaLocation::File(path) => path.display().to_string(),
            MediaLocation::Http(url) => url.clone(),
        }
    }
}

enum Fetch {
    /// Response headers arrived; carries the body length when known
    Started(Option<u64>),
    Chunk(Vec<u8>),
    Failed(String),
}

/// Blocking reader over an HTTP body fetched on its own thread
///
/// Every wait for the next chunk is bounded by `stall`, so a dead server
/// ends the stream with an error instead of wedging the decoder.
struct HttpStream {
    rx: Receiver<Fetch>,
    pending: Vec<u8>,
    offset: usize,
    stall: Duration,
}

impl HttpStream {
    /// Issue the request and wait up to `timeout` for the response headers
    fn connect(url: &str, timeout: Duration) -> Result<(Self, Option<u64>), String> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| e.to_string())?;
        let (tx, rx) = bounded::<Fetch>(HTTP_QUEUED_CHUNKS);
        let request = client.get(url);

        thread::Builder::new()
            .name("hiresti-http".into())
            .spawn(move || {
                let mut response = match request.send().and_then(|r| r.error_for_status()) {
                    Ok(response) => response,
                    Err(e) => {
                        let _ = tx.send(Fetch::Failed(e.to_string()));
                        return;
                    }
                };
                if tx.send(Fetch::Started(response.content_length())).is_err() {
                    return;
                }
                loop {
                    let mut chunk = vec![0u8; HTTP_CHUNK_BYTES];
                    match response.read(&mut chunk) {
                        Ok(0) => return,
                        Ok(n) => {
                            chunk.truncate(n);
                            // Receiver gone: the session was closed
                            if tx.send(Fetch::Chunk(chunk)).is_err() {
                                return;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            let _ = tx.send(Fetch::Failed(e.to_string()));
                            return;
                        }
                    }
                }
            })
            .map_err(|e| e.to_string())?;

        match rx.recv_timeout(timeout) {
            Ok(Fetch::Started(length)) => Ok((
                Self {
                    rx,
                    pending: Vec::new(),
                    offset: 0,
                    stall: timeout,
                },
                length,
            )),
            Ok(Fetch::Failed(message)) => Err(message),
            Ok(Fetch::Chunk(_)) => Err("body before headers".to_string()),
            Err(RecvTimeoutError::Timeout) => Err(format!("no response within {:?} (timeout)", timeout)),
            Err(RecvTimeoutError::Disconnected) => Err("connection closed".to_string()),
        }
    }
}

impl Read for HttpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.pending.len() {
            match self.rx.recv_timeout(self.stall) {
                Ok(Fetch::Chunk(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Ok(Fetch::Started(_)) => {}
                Ok(Fetch::Failed(message)) => return Err(io::Error::other(message)),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "network stream stalled (timeout)"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

fn open(location: &MediaLocation, timeout: Duration) -> PipelineResult<Probed> {
    let load_err = |message: String| PipelineError::Load {
        uri: location.describe(),
        message,
    };

    let (source, size): (Box<dyn MediaSource>, u64) = match location {
        MediaLocation::File(path) => {
            let file = File::open(path).map_err(|e| load_err(e.to_string()))?;
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            (Box::new(file), size)
        }
        MediaLocation::Http(url) => {
            let (stream, length) = HttpStream::connect(url, timeout).map_err(load_err)?;
            (Box::new(ReadOnlySource::new(stream)), length.unwrap_or(0))
        }
    };
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = location.extension() {
        hint.with_extension(&ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| load_err(format!("no demuxer: {}", e)))?;
    let reader = probed.format;

    let track = reader
        .default_track()
        .ok_or_else(|| load_err("no audio track".to_string()))?;
    let params = track.codec_params.clone();
    let track_id = track.id;

    let codec = symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|d| d.short_name)
        .unwrap_or("");
    let mut format = StreamFormat::new(
        params.sample_rate.unwrap_or(0),
        params.bits_per_sample.unwrap_or(0) as u16,
        codec,
    );
    format.channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);

    let duration_s = match (params.n_frames, params.time_base) {
        (Some(frames), Some(tb)) => {
            let t = tb.calc_time(frames);
            Some(t.seconds as f64 + t.frac)
        }
        (Some(frames), None) if format.rate > 0 => Some(frames as f64 / f64::from(format.rate)),
        _ => None,
    };
    if let Some(d) = duration_s.filter(|d| *d > 0.0 && size > 0) {
        format.bitrate = ((size as f64 * 8.0) / d) as u32;
    }

    let decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| load_err(format!("unsupported codec: {}", e)))?;

    Ok(Probed {
        reader,
        decoder,
        track_id,
        format,
        duration_s,
    })
}

/// Linear interpolation between two stereo frames
struct LinearResampler {
    step: f64,
    pos: f64,
    prev: [f32; 2],
    out: Vec<f32>,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: f64::from(from_rate) / f64::from(to_rate.max(1)),
            pos: 0.0,
            prev: [0.0; 2],
            out: Vec::new(),
        }
    }

    fn process(&mut self, input: &[f32]) -> &[f32] {
        self.out.clear();
        let frames = input.len() / 2;
        if frames == 0 {
            return &self.out;
        }
        let frame = |i: usize, prev: [f32; 2]| -> [f32; 2] {
            if i == 0 {
                prev
            } else {
                [input[(i - 1) * 2], input[(i - 1) * 2 + 1]]
            }
        };
        while self.pos + 1.0 <= frames as f64 {
            let i = self.pos as usize;
            let frac = (self.pos - i as f64) as f32;
            let a = frame(i, self.prev);
            let b = frame(i + 1, self.prev);
            self.out.push(a[0] + (b[0] - a[0]) * frac);
            self.out.push(a[1] + (b[1] - a[1]) * frac);
            self.pos += self.step;
        }
        self.pos -= frames as f64;
        self.prev = [input[(frames - 1) * 2], input[(frames - 1) * 2 + 1]];
        &self.out
    }
}

/// Fold any channel layout into interleaved stereo
fn to_stereo(samples: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    match channels {
        0 => {}
        1 => {
            for s in samples {
                out.push(*s);
                out.push(*s);
            }
        }
        2 => out.extend_from_slice(samples),
        n => {
            for frame in samples.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
        }
    }
}

/// Flags shared by the decode thread, the output callback and the backend
#[derive(Default)]
struct SessionShared {
    stop: AtomicBool,
    finished: AtomicBool,
    eos_sent: AtomicBool,
    frames_out: AtomicU64,
}

struct Session {
    stream: Stream,
    decoder: Option<JoinHandle<()>>,
    shared: Arc<SessionShared>,
    start_s: f64,
    sink: SinkFormat,
}

impl Session {
    fn position(&self) -> f64 {
        let frames = self.shared.frames_out.load(Ordering::Relaxed);
        self.start_s + frames as f64 / f64::from(self.sink.rate.max(1))
    }

    fn close(mut self) -> f64 {
        let position = self.position();
        self.shared.stop.store(true, Ordering::SeqCst);
        let _ = self.stream.pause();
        if let Some(handle) = self.decoder.take() {
            let _ = handle.join();
        }
        position
    }
}

struct DecodeJob {
    probed: Probed,
    producer: Producer<f32>,
    shared: Arc<SessionShared>,
    resampler: Option<LinearResampler>,
    events: Sender<BackendEvent>,
}

impl DecodeJob {
    fn run(mut self) {
        let mut sample_buf: Option<SampleBuffer<f32>> = None;
        let mut buf_frames = 0u64;
        let mut stereo = Vec::new();
        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                return;
            }
            let packet = match self.probed.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(SymphoniaError::ResetRequired) => {
                    self.probed.decoder.reset();
                    continue;
                }
                Err(e) => {
                    let _ = self.events.send(BackendEvent::Error(format!("demux error: {}", e)));
                    break;
                }
            };
            if packet.track_id() != self.probed.track_id {
                continue;
            }
            let decoded = match self.probed.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => {
                    let _ = self.events.send(BackendEvent::Error(format!("decoder error: {}", e)));
                    break;
                }
            };

            let spec = *decoded.spec();
            let needed = decoded.capacity() as u64;
            if sample_buf.is_none() || buf_frames < needed {
                sample_buf = Some(SampleBuffer::<f32>::new(needed, spec));
                buf_frames = needed;
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);
            to_stereo(buf.samples(), spec.channels.count(), &mut stereo);

            let ok = match self.resampler.as_mut() {
                Some(resampler) => {
                    let out = resampler.process(&stereo);
                    push_all(&mut self.producer, out, &self.shared.stop)
                }
                None => push_all(&mut self.producer, &stereo, &self.shared.stop),
            };
            if !ok {
                return;
            }
        }
        self.shared.finished.store(true, Ordering::SeqCst);
        debug!("Decode finished");
    }
}

/// Block until `samples` are queued; false when stopped first
fn push_all(producer: &mut Producer<f32>, samples: &[f32], stop: &AtomicBool) -> bool {
    let mut offset = 0;
    while offset < samples.len() {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        // Whole frames only, so the callback never sees a split pair
        let n = producer.slots().min(samples.len() - offset) & !1;
        if n == 0 {
            thread::sleep(Duration::from_millis(2));
            continue;
        }
        if let Ok(chunk) = producer.write_chunk_uninit(n) {
            offset += chunk.fill_from_iter(samples[offset..offset + n].iter().copied());
        }
    }
    true
}

/// State owned by the output callback
struct Renderer {
    consumer: Consumer<f32>,
    chain: ProcessorChain,
    scratch: Vec<f32>,
    shared: Arc<SessionShared>,
    events: Sender<BackendEvent>,
}

impl Renderer {
    fn render<T: SizedSample + FromSample<f32>>(&mut self, out: &mut [T]) {
        if self.scratch.len() < out.len() {
            self.scratch.resize(out.len(), 0.0);
        }
        let buf = &mut self.scratch[..out.len()];

        let to_read = buf.len().min(self.consumer.slots());
        if to_read < buf.len() {
            buf[to_read..].fill(0.0);
        }
        if let Ok(chunk) = self.consumer.read_chunk(to_read) {
            let (first, second) = chunk.as_slices();
            buf[..first.len()].copy_from_slice(first);
            buf[first.len()..first.len() + second.len()].copy_from_slice(second);
            chunk.commit_all();
        }
        self.shared
            .frames_out
            .fetch_add((to_read / OUTPUT_CHANNELS) as u64, Ordering::Relaxed);

        if to_read > 0 {
            self.chain.process(buf);
        } else if self.shared.finished.load(Ordering::Relaxed)
            && !self.shared.eos_sent.swap(true, Ordering::SeqCst)
        {
            let _ = self.events.try_send(BackendEvent::Eos);
        }

        for (o, s) in out.iter_mut().zip(buf.iter()) {
            *o = T::from_sample(*s);
        }
    }
}

/// Bits a sample format carries without rounding
fn container_depth(format: SampleFormat) -> Option<u16> {
    match format {
        SampleFormat::F32 => Some(24),
        SampleFormat::I32 => Some(32),
        SampleFormat::I16 => Some(16),
        _ => None,
    }
}

/// Card-index ALSA ids (`hw:1,0`) as cpal names them
fn alsa_aliases(id: &str, exclusive: bool) -> Vec<String> {
    let mut aliases = vec![id.to_string()];
    let Some((card, dev)) = id.strip_prefix("hw:").and_then(|rest| rest.split_once(',')) else {
        return aliases;
    };
    if let Ok(card_id) = std::fs::read_to_string(format!("/proc/asound/card{}/id", card)) {
        let card_id = card_id.trim();
        if !exclusive {
            aliases.insert(0, format!("plughw:CARD={},DEV={}", card_id, dev));
        }
        aliases.push(format!("hw:CARD={},DEV={}", card_id, dev));
    }
    aliases
}

fn select_device(host: &cpal::Host, plan: &GraphPlan) -> PipelineResult<Device> {
    let wanted: Vec<String> = match plan.driver {
        Driver::Auto => Vec::new(),
        Driver::Alsa => plan
            .device_id
            .as_deref()
            .map(|id| alsa_aliases(id, plan.exclusive))
            .unwrap_or_else(|| vec!["default".to_string()]),
        Driver::PipeWire => vec!["pipewire".to_string()],
        Driver::PulseAudio => vec!["pulse".to_string()],
    };

    if !wanted.is_empty() {
        let mut devices: Vec<(String, Device)> = host
            .output_devices()
            .map_err(|e| PipelineError::Output(e.to_string()))?
            .filter_map(|d| d.name().ok().map(|name| (name, d)))
            .collect();
        for alias in &wanted {
            if let Some(idx) = devices.iter().position(|(name, _)| name == alias) {
                let (name, device) = devices.swap_remove(idx);
                debug!("Selected output {} for {}", name, plan.device_name);
                return Ok(device);
            }
        }
        if plan.exclusive {
            return Err(PipelineError::Output(format!(
                "No such device: {}",
                plan.device_id.as_deref().unwrap_or(&plan.device_name)
            )));
        }
        warn!("{} not found on {}; using default output", plan.device_name, plan.driver);
    }

    host.default_output_device()
        .ok_or_else(|| PipelineError::Output("No output device available".to_string()))
}

/// Codec backend for local files
pub struct NativeBackend {
    host: cpal::Host,
    location: Option<MediaLocation>,
    load_timeout: Duration,
    media: Option<LoadedMedia>,
    session: Option<Session>,
    /// Plan and stage of the current session, reused to restart after seeks
    active: Option<(GraphPlan, SoftwareStage)>,
    resume_s: f64,
    playing: bool,
    latency: (u32, u32),
    events_tx: Sender<BackendEvent>,
    events_rx: Receiver<BackendEvent>,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            host: cpal::default_host(),
            location: None,
            load_timeout: Duration::from_secs(10),
            media: None,
            session: None,
            active: None,
            resume_s: 0.0,
            playing: false,
            latency: (100, 10),
            events_tx,
            events_rx,
        }
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.resume_s = session.close();
        }
    }

    fn open_session(&mut self, plan: &GraphPlan, stage: &SoftwareStage) -> PipelineResult<SinkFormat> {
        let (location, source) = match (self.location.as_ref(), self.media.as_ref()) {
            (Some(location), Some(media)) => (location.clone(), media.format.clone()),
            _ => return Err(PipelineError::NoMedia),
        };

        let device = select_device(&self.host, plan)?;
        let wanted_rate = plan.target.map(|(rate, _)| rate).unwrap_or(source.rate);

        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| PipelineError::Output(e.to_string()))?
            .filter(|r| usize::from(r.channels()) == OUTPUT_CHANNELS)
            .filter(|r| container_depth(r.sample_format()).is_some())
            .collect();
        let at_rate = |rate: u32| {
            let mut candidates: Vec<_> = ranges
                .iter()
                .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
                .collect();
            candidates.sort_by_key(|r| match r.sample_format() {
                SampleFormat::F32 => 0,
                SampleFormat::I32 => 1,
                _ => 2,
            });
            candidates.first().map(|r| (*r).clone().with_sample_rate(cpal::SampleRate(rate)))
        };

        let supported = match at_rate(wanted_rate) {
            Some(config) => config,
            None => {
                let fallback = device
                    .default_output_config()
                    .map_err(|e| PipelineError::Output(e.to_string()))?;
                if plan.exclusive {
                    return Err(PipelineError::FormatMismatch {
                        source_rate: source.rate,
                        source_depth: source.effective_depth(),
                        sink_rate: fallback.sample_rate().0,
                        sink_depth: container_depth(fallback.sample_format()).unwrap_or(0),
                    });
                }
                at_rate(fallback.sample_rate().0).unwrap_or(fallback)
            }
        };

        let sample_format = supported.sample_format();
        let rate = supported.sample_rate().0;
        let capacity = container_depth(sample_format).unwrap_or(0);
        let depth = source.effective_depth().min(capacity);
        let sink = SinkFormat {
            rate,
            depth,
            channels: OUTPUT_CHANNELS as u16,
        };

        let (buffer_ms, latency_ms) = self.latency;
        let period = (rate as usize * latency_ms as usize / 1000).max(64) as u32;
        let buffer_size = match supported.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&period) => {
                cpal::BufferSize::Fixed(period)
            }
            _ => cpal::BufferSize::Default,
        };
        let config = StreamConfig {
            channels: OUTPUT_CHANNELS as u16,
            sample_rate: cpal::SampleRate(rate),
            buffer_size,
        };

        let mut probed = open(&location, self.load_timeout)?;
        if self.resume_s > 0.0 {
            let seek = probed.reader.seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(self.resume_s),
                    track_id: Some(probed.track_id),
                },
            );
            match seek {
                Ok(_) => probed.decoder.reset(),
                Err(e) => {
                    debug!("Stream not seekable: {}", e);
                    self.resume_s = 0.0;
                }
            }
        }

        let ring = (rate as usize * OUTPUT_CHANNELS * buffer_ms as usize / 1000).max(MIN_RING_SAMPLES);
        let (producer, consumer) = RingBuffer::<f32>::new(ring);
        let shared = Arc::new(SessionShared::default());

        let resampler = (source.rate != 0 && source.rate != rate).then(|| {
            info!("Resampling {}Hz -> {}Hz", source.rate, rate);
            LinearResampler::new(source.rate, rate)
        });

        let mut renderer = Renderer {
            consumer,
            chain: stage.build_chain(plan, rate as f32, OUTPUT_CHANNELS, period as usize),
            scratch: vec![0.0; period as usize * OUTPUT_CHANNELS * 4],
            shared: Arc::clone(&shared),
            events: self.events_tx.clone(),
        };
        let err_tx = self.events_tx.clone();
        let on_error = move |err: StreamError| {
            let message = match err {
                StreamError::DeviceNotAvailable => "Output device disconnected (no such device)".to_string(),
                other => other.to_string(),
            };
            let _ = err_tx.try_send(BackendEvent::Error(message));
        };

        let stream = match sample_format {
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| renderer.render(data),
                on_error,
                None,
            ),
            SampleFormat::I32 => device.build_output_stream(
                &config,
                move |data: &mut [i32], _: &cpal::OutputCallbackInfo| renderer.render(data),
                on_error,
                None,
            ),
            _ => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.render(data),
                on_error,
                None,
            ),
        }
        .map_err(|e| PipelineError::Output(e.to_string()))?;

        let job = DecodeJob {
            probed,
            producer,
            shared: Arc::clone(&shared),
            resampler,
            events: self.events_tx.clone(),
        };
        let decoder = thread::Builder::new()
            .name("hiresti-decode".into())
            .spawn(move || job.run())
            .map_err(|e| PipelineError::Output(e.to_string()))?;

        if self.playing {
            stream.play().map_err(|e| PipelineError::Output(e.to_string()))?;
        } else {
            let _ = stream.pause();
        }

        self.session = Some(Session {
            stream,
            decoder: Some(decoder),
            shared,
            start_s: self.resume_s,
            sink,
        });
        Ok(sink)
    }
}

impl CodecBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn load(&mut self, uri: &str, timeout: Duration) -> PipelineResult<LoadedMedia> {
        self.stop();
        let location = MediaLocation::parse(uri);
        let probed = open(&location, timeout)?;
        let media = LoadedMedia {
            format: probed.format,
            duration_s: probed.duration_s,
        };
        self.location = Some(location);
        self.load_timeout = timeout;
        self.media = Some(media.clone());
        self.resume_s = 0.0;
        Ok(media)
    }

    fn configure_output(&mut self, plan: &GraphPlan, stage: &SoftwareStage) -> PipelineResult<SinkFormat> {
        self.close_session();
        self.active = Some((plan.clone(), stage.clone()));
        self.open_session(plan, stage)
    }

    fn play(&mut self) -> PipelineResult<()> {
        if self.media.is_none() {
            return Err(PipelineError::NoMedia);
        }
        self.playing = true;
        if let Some(session) = self.session.as_ref() {
            session
                .stream
                .play()
                .map_err(|e| PipelineError::Output(e.to_string()))?;
        }
        Ok(())
    }

    fn pause(&mut self) -> PipelineResult<()> {
        self.playing = false;
        if let Some(session) = self.session.as_ref() {
            session
                .stream
                .pause()
                .map_err(|e| PipelineError::Output(e.to_string()))?;
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.playing = false;
        self.close_session();
        self.location = None;
        self.media = None;
        self.active = None;
        self.resume_s = 0.0;
    }

    fn seek(&mut self, position_s: f64) -> PipelineResult<()> {
        if self.media.is_none() {
            return Err(PipelineError::NoMedia);
        }
        let Some((plan, stage)) = self.active.clone() else {
            self.resume_s = position_s;
            return Ok(());
        };
        self.close_session();
        self.resume_s = position_s;
        self.open_session(&plan, &stage).map(|_| ())
    }

    fn position(&self) -> Option<f64> {
        self.media.as_ref()?;
        Some(self.session.as_ref().map(Session::position).unwrap_or(self.resume_s))
    }

    fn set_latency(&mut self, buffer_ms: u32, latency_ms: u32) {
        self.latency = (buffer_ms, latency_ms);
    }

    fn poll_event(&mut self) -> Option<BackendEvent> {
        self.events_rx.try_recv().ok()
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        self.close_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::TcpListener;

    /// 16-bit stereo PCM WAV of `frames` silent frames
    fn wav_bytes(rate: u32, frames: u32) -> Vec<u8> {
        let data_len = frames * 4;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * 4).to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.resize(44 + data_len as usize, 0);
        out
    }

    /// Answer one request on a loopback port with `status` and `body`
    fn serve_once(status: &'static str, body: Vec<u8>, path: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}{}", listener.local_addr().unwrap(), path);
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Type: audio/wav\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            let _ = conn.write_all(head.as_bytes());
            let _ = conn.write_all(&body);
        });
        url
    }

    #[test]
    fn test_media_location() {
        assert_eq!(
            MediaLocation::parse("file:///music/a.flac"),
            MediaLocation::File(PathBuf::from("/music/a.flac"))
        );
        let signed = MediaLocation::parse("https://cdn.example/t/42.FLAC?token=a.b#frag");
        assert!(matches!(signed, MediaLocation::Http(_)));
        assert_eq!(signed.extension().as_deref(), Some("flac"));
        assert_eq!(MediaLocation::parse("https://cdn.example/stream").extension(), None);
    }

    #[test]
    fn test_http_stream_decodes_to_end() {
        let url = serve_once("200 OK", wav_bytes(44100, 4410), "/tracks/42.wav?token=abc");
        let mut probed = open(&MediaLocation::parse(&url), Duration::from_secs(5)).unwrap();
        assert_eq!(probed.format.rate, 44100);
        assert_eq!(probed.format.depth, 16);
        let duration = probed.duration_s.unwrap();
        assert!((duration - 0.1).abs() < 1e-6, "duration {}", duration);

        let mut frames = 0u64;
        loop {
            match probed.reader.next_packet() {
                Ok(packet) => frames += packet.dur,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => panic!("unexpected demux error: {}", e),
            }
        }
        assert_eq!(frames, 4410);
    }

    #[test]
    fn test_backend_loads_remote_uri() {
        let url = serve_once("200 OK", wav_bytes(48000, 9600), "/stream/7.wav?sig=f00&exp=1");
        let mut backend = NativeBackend::new();
        let media = backend.load(&url, Duration::from_secs(5)).unwrap();
        assert_eq!(media.format.rate, 48000);
        assert!((media.duration_s.unwrap() - 0.2).abs() < 1e-6);
        assert!(matches!(backend.location, Some(MediaLocation::Http(_))));
        backend.stop();
        assert!(backend.location.is_none());
    }

    #[test]
    fn test_http_error_status_fails_load() {
        let url = serve_once("404 Not Found", Vec::new(), "/gone.flac");
        let mut backend = NativeBackend::new();
        let err = backend.load(&url, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, PipelineError::Load { .. }));
        assert!(err.to_string().contains("404"), "{}", err);
    }

    #[test]
    fn test_http_silent_server_times_out() {
        // Accepted by the kernel backlog but never answered
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/slow.flac", listener.local_addr().unwrap());
        let started = std::time::Instant::now();
        let err = open(&MediaLocation::parse(&url), Duration::from_millis(200)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(err.to_string().contains("timeout"), "{}", err);
        drop(listener);
    }

    #[test]
    fn test_open_missing_file() {
        let mut backend = NativeBackend::new();
        let err = backend
            .load("/nonexistent/track.flac", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load { .. }));
        assert!(backend.position().is_none());
    }

    #[test]
    fn test_to_stereo() {
        let mut out = Vec::new();
        to_stereo(&[0.1, 0.2], 1, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
        to_stereo(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_resampler_ratio() {
        let mut resampler = LinearResampler::new(44100, 88200);
        let input: Vec<f32> = (0..441).flat_map(|i| [i as f32, i as f32]).collect();
        let produced = resampler.process(&input).len() / 2;
        assert!((880..=884).contains(&produced), "produced {}", produced);

        let mut down = LinearResampler::new(96000, 48000);
        let input = vec![0.5f32; 960 * 2];
        let out = down.process(&input);
        assert!((479..=481).contains(&(out.len() / 2)));
        assert!(out.iter().skip(2).all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_container_depth() {
        assert_eq!(container_depth(SampleFormat::F32), Some(24));
        assert_eq!(container_depth(SampleFormat::I16), Some(16));
        assert_eq!(container_depth(SampleFormat::U8), None);
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_default_output_opens() {
        let host = cpal::default_host();
        let plan = crate::pipeline::graph::build_graph(&Default::default(), None, false).unwrap();
        assert!(select_device(&host, &plan).is_ok());
    }
}
