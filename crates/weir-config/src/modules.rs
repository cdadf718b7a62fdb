//! Built-in module kinds.
//!
//! Small reference modules that let a configuration describe a runnable
//! graph without custom code: a gain stage, a frame accumulator that holds
//! partial input, a splitter, a sink and a tone generator. `passthrough`
//! maps to the engine's module-less copy node.

use std::collections::HashMap;

use weir_core::{InOut, MediaFormat, Module, ModuleCaps, ProcessIo, ProcessStatus};

use crate::error::ConfigError;

/// Registry entry describing one module kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleKindInfo {
    /// Name used in `kind = "..."`.
    pub name: &'static str,
    /// One-line description.
    pub description: &'static str,
    /// Inputs created when the module lists none.
    pub default_inputs: usize,
    /// Outputs created when the module lists none.
    pub default_outputs: usize,
}

/// All module kinds the builder knows.
pub const MODULE_KINDS: &[ModuleKindInfo] = &[
    ModuleKindInfo {
        name: "passthrough",
        description: "In-place copy of input to output",
        default_inputs: 1,
        default_outputs: 1,
    },
    ModuleKindInfo {
        name: "gain",
        description: "In-place 16-bit PCM gain (param: gain)",
        default_inputs: 1,
        default_outputs: 1,
    },
    ModuleKindInfo {
        name: "accumulate",
        description: "Holds input until a full frame is buffered (param: frame_bytes)",
        default_inputs: 1,
        default_outputs: 1,
    },
    ModuleKindInfo {
        name: "splitter",
        description: "Copies its input to every output",
        default_inputs: 1,
        default_outputs: 2,
    },
    ModuleKindInfo {
        name: "sink",
        description: "Consumes and discards its input",
        default_inputs: 1,
        default_outputs: 0,
    },
    ModuleKindInfo {
        name: "tone",
        description: "16-bit sine source (params: freq, amplitude)",
        default_inputs: 0,
        default_outputs: 1,
    },
];

/// Looks up a module kind by name.
pub fn module_kind(name: &str) -> Option<&'static ModuleKindInfo> {
    MODULE_KINDS.iter().find(|k| k.name == name)
}

/// Parse a parameter value string into an f32.
///
/// Supports:
/// - Plain numbers: "0.5", "-0.3"
/// - Percentages: "50%" (divided by 100)
/// - Decibels: "-6dB" (converted to linear gain)
/// - Frequency: "440Hz", "1.2kHz"
pub fn parse_param_value(value: &str) -> Option<f32> {
    let value = value.trim();

    if let Some(pct) = value.strip_suffix('%') {
        return pct.trim().parse::<f32>().ok().map(|v| v / 100.0);
    }

    if let Some(db) = value
        .strip_suffix("dB")
        .or_else(|| value.strip_suffix("db"))
    {
        return db
            .trim()
            .parse::<f32>()
            .ok()
            .map(|v| libm::powf(10.0, v / 20.0));
    }

    if let Some(khz) = value
        .strip_suffix("kHz")
        .or_else(|| value.strip_suffix("khz"))
    {
        return khz.trim().parse::<f32>().ok().map(|v| v * 1000.0);
    }

    if let Some(hz) = value
        .strip_suffix("Hz")
        .or_else(|| value.strip_suffix("hz"))
    {
        return hz.trim().parse::<f32>().ok();
    }

    value.parse::<f32>().ok()
}

fn param(
    module: &str,
    params: &HashMap<String, String>,
    key: &str,
    default: f32,
) -> Result<f32, ConfigError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => parse_param_value(raw)
            .filter(|v| v.is_finite())
            .ok_or_else(|| ConfigError::invalid_param(module, key, format!("cannot parse '{raw}'"))),
    }
}

/// Creates the module for `kind`.
///
/// Returns `Ok(None)` for `passthrough`, which the engine runs without a
/// module object.
pub fn create_module(
    module: &str,
    kind: &str,
    params: &HashMap<String, String>,
) -> Result<Option<Box<dyn Module + Send>>, ConfigError> {
    let m: Box<dyn Module + Send> = match kind {
        "passthrough" => return Ok(None),
        "gain" => Box::new(Gain::new(param(module, params, "gain", 1.0)?)),
        "accumulate" => {
            let frame = param(module, params, "frame_bytes", 0.0)?;
            if frame < 0.0 {
                return Err(ConfigError::invalid_param(module, "frame_bytes", "must not be negative"));
            }
            Box::new(Accumulate::new(frame as u32))
        }
        "splitter" => Box::new(Splitter),
        "sink" => Box::new(Sink),
        "tone" => {
            let freq = param(module, params, "freq", 440.0)?;
            if freq <= 0.0 {
                return Err(ConfigError::invalid_param(module, "freq", "must be positive"));
            }
            Box::new(Tone::new(freq, param(module, params, "amplitude", 0.5)?))
        }
        other => {
            return Err(ConfigError::UnknownModuleKind {
                module: module.to_string(),
                kind: other.to_string(),
            });
        }
    };
    Ok(Some(m))
}

/// Wraps a module to override the capabilities the engine reads.
pub(crate) struct WithCaps {
    inner: Box<dyn Module + Send>,
    caps: ModuleCaps,
}

impl WithCaps {
    pub(crate) fn new(inner: Box<dyn Module + Send>, caps: ModuleCaps) -> Self {
        Self { inner, caps }
    }
}

impl Module for WithCaps {
    fn caps(&self) -> ModuleCaps {
        self.caps.clone()
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        self.inner.process(io)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn output_format(&mut self, output: usize, input: MediaFormat) -> MediaFormat {
        self.inner.output_format(output, input)
    }
}

// ---------------------------------------------------------------------------
// Gain
// ---------------------------------------------------------------------------

/// Scales 16-bit little-endian PCM. Other word sizes pass unchanged.
pub struct Gain {
    gain: f32,
}

impl Gain {
    /// Linear gain factor.
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }

    fn scale(&self, sample: [u8; 2]) -> [u8; 2] {
        let s = f32::from(i16::from_le_bytes(sample)) * self.gain;
        (s.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16).to_le_bytes()
    }
}

impl Module for Gain {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps {
            in_place: true,
            ..ModuleCaps::default()
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let n = io.input_len(0).min(io.output_capacity(0)) as usize;
        let pcm16 = io.input_format(0).bytes_per_sample == 2;
        let bufs = io.input_format(0).bufs_num();

        for ch in 0..bufs {
            match io.in_out(0, 0, ch) {
                Some(InOut::Aliased(buf)) => {
                    if pcm16 {
                        for s in buf[..n].chunks_exact_mut(2) {
                            let out = self.scale([s[0], s[1]]);
                            s.copy_from_slice(&out);
                        }
                    }
                }
                Some(InOut::Split(src, dst)) => {
                    let n = n.min(src.len()).min(dst.len());
                    if pcm16 {
                        for (d, s) in dst[..n].chunks_exact_mut(2).zip(src[..n].chunks_exact(2)) {
                            d.copy_from_slice(&self.scale([s[0], s[1]]));
                        }
                    } else {
                        dst[..n].copy_from_slice(&src[..n]);
                    }
                }
                None => return ProcessStatus::Failed,
            }
        }
        io.set_consumed(0, n as u32);
        io.set_produced(0, n as u32);
        ProcessStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Accumulate
// ---------------------------------------------------------------------------

/// Emits whole frames and keeps the remainder buffered at its input.
pub struct Accumulate {
    frame_bytes: u32,
}

impl Accumulate {
    /// `frame_bytes` of 0 means "one full output buffer".
    pub fn new(frame_bytes: u32) -> Self {
        Self { frame_bytes }
    }
}

impl Module for Accumulate {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps {
            requires_data_buffering: true,
            ..ModuleCaps::default()
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let cap = io.output_capacity(0);
        let frame = if self.frame_bytes == 0 {
            cap
        } else {
            self.frame_bytes.min(cap)
        };
        if frame == 0 || io.input_len(0) < frame {
            io.set_consumed(0, 0);
            io.set_produced(0, 0);
            return ProcessStatus::NeedMore;
        }

        let n = frame as usize;
        for ch in 0..io.input_format(0).bufs_num() {
            match io.in_out(0, 0, ch) {
                Some(InOut::Split(src, dst)) => dst[..n].copy_from_slice(&src[..n]),
                Some(InOut::Aliased(_)) => {}
                None => return ProcessStatus::Failed,
            }
        }
        io.set_consumed(0, frame);
        io.set_produced(0, frame);
        ProcessStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Splitter / Sink
// ---------------------------------------------------------------------------

/// Copies input 0 to every output.
pub struct Splitter;

impl Module for Splitter {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps::default()
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let bufs = io.input_format(0).bufs_num();
        let mut len = io.input_len(0);
        for o in 0..io.num_outputs() {
            if io.has_output_buffer(o) {
                len = len.min(io.output_capacity(o));
            }
        }

        for ch in 0..bufs {
            let bytes = io.input_bytes(0, ch);
            let data = bytes[..bytes.len().min(len as usize)].to_vec();
            for o in 0..io.num_outputs() {
                if io.has_output_buffer(o) {
                    let window = io.output_window(o, ch);
                    let n = data.len().min(window.len());
                    window[..n].copy_from_slice(&data[..n]);
                }
            }
        }
        for o in 0..io.num_outputs() {
            if io.has_output_buffer(o) {
                io.set_produced(o, len);
            }
        }
        io.set_consumed(0, len);
        ProcessStatus::Ok
    }
}

/// Consumes everything it is given.
pub struct Sink;

impl Module for Sink {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps {
            is_sink: true,
            ..ModuleCaps::default()
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        for i in 0..io.num_inputs() {
            let len = io.input_len(i);
            io.set_consumed(i, len);
        }
        ProcessStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Tone
// ---------------------------------------------------------------------------

/// Sine generator filling every output buffer it is given.
pub struct Tone {
    freq: f32,
    amplitude: f32,
    phase: f32,
}

impl Tone {
    /// Frequency in Hz, amplitude in 0..=1.
    pub fn new(freq: f32, amplitude: f32) -> Self {
        Self {
            freq,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
        }
    }

    fn next_sample(&mut self, sample_rate: u32) -> [u8; 2] {
        let s = libm::sinf(self.phase * core::f32::consts::TAU) * self.amplitude;
        self.phase += self.freq / sample_rate as f32;
        self.phase -= libm::floorf(self.phase);
        ((s * f32::from(i16::MAX)) as i16).to_le_bytes()
    }
}

impl Module for Tone {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps {
            is_source: true,
            ..ModuleCaps::default()
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let fmt = io.output_format(0);
        if fmt.bytes_per_sample != 2 || fmt.num_channels == 0 || fmt.sample_rate == 0 {
            return ProcessStatus::Failed;
        }
        let nch = usize::from(fmt.num_channels);
        let cap = io.output_capacity(0) as usize;

        let produced = if fmt.interleaving.is_unpacked() {
            let frames = cap / 2;
            for f in 0..frames {
                let s = self.next_sample(fmt.sample_rate);
                for ch in 0..nch {
                    io.output_window(0, ch)[f * 2..f * 2 + 2].copy_from_slice(&s);
                }
            }
            frames * 2
        } else {
            let frames = cap / (2 * nch);
            let packed = fmt.is_deinterleaved_packed();
            let window = io.output_window(0, 0);
            for f in 0..frames {
                let s = self.next_sample(fmt.sample_rate);
                for ch in 0..nch {
                    let at = if packed { ch * frames * 2 + f * 2 } else { (f * nch + ch) * 2 };
                    window[at..at + 2].copy_from_slice(&s);
                }
            }
            frames * 2 * nch
        };
        io.set_produced(0, produced as u32);
        ProcessStatus::Ok
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }
}
