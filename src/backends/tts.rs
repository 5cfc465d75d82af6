//! Speech synthesis engines.

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::endpoint_url;
use super::process::{path_arg, run_once};
use crate::config::TtsSettings;
use crate::error::BackendError;
use crate::task::AudioFormat;

/// Voice name that selects the engine's own default voice.
pub const DEFAULT_VOICE: &str = "default";

/// Fully resolved synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParams {
    pub text: String,
    pub voice: String,
    pub speed: f32,
    pub pitch: f32,
    pub volume: f32,
    pub format: AudioFormat,
    pub sample_rate: u32,
    /// Where the artifact is written.
    pub output_path: PathBuf,
}

/// A written audio artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub path: PathBuf,
    pub audio: Vec<u8>,
    pub duration_ms: u64,
}

/// A CPU speech engine. Never touches a GPU.
#[async_trait]
pub trait SynthesisBackend: Send {
    fn name(&self) -> &'static str;

    async fn initialize(&mut self, model_path: &Path) -> Result<(), BackendError>;

    async fn shutdown(&mut self);

    fn is_ready(&self) -> bool;

    async fn synthesize(&mut self, params: &SynthesisParams)
    -> Result<SynthesisOutput, BackendError>;

    /// Voices the engine knows. Empty means the engine accepts any name.
    fn available_voices(&self) -> Vec<String>;

    fn set_num_threads(&mut self, num_threads: usize);

    /// Threads the engine will use; 0 when it runs out of process.
    fn num_threads(&self) -> usize;
}

pub fn create_synthesis_backend(
    settings: &TtsSettings,
) -> Result<Box<dyn SynthesisBackend>, BackendError> {
    let worker = &settings.worker;
    let mut backend: Box<dyn SynthesisBackend> = match worker.backend.as_str() {
        "neural" => {
            let endpoint = worker.endpoint.clone().ok_or_else(|| {
                BackendError::InvalidParameters("neural backend requires an endpoint".into())
            })?;
            Box::new(NeuralSynthesis::new(endpoint, worker.request_timeout)?)
        }
        "process" => {
            let executable = worker.executable.clone().ok_or_else(|| {
                BackendError::InvalidParameters("process backend requires an executable".into())
            })?;
            Box::new(ProcessSynthesis::new(executable, worker.request_timeout))
        }
        "mock" => Box::new(MockSynthesis::new(worker.mock_latency)),
        other => {
            return Err(BackendError::UnknownBackend {
                what: "synthesis".into(),
                name: other.to_string(),
            });
        }
    };
    backend.set_num_threads(settings.num_threads);
    Ok(backend)
}

/// Neural vocoder served over HTTP (Coqui TTS server protocol).
pub struct NeuralSynthesis {
    client: reqwest::Client,
    endpoint: String,
    ready: bool,
}

impl NeuralSynthesis {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.into(),
            ready: false,
        })
    }
}

#[async_trait]
impl SynthesisBackend for NeuralSynthesis {
    fn name(&self) -> &'static str {
        "neural"
    }

    async fn initialize(&mut self, _model_path: &Path) -> Result<(), BackendError> {
        let resp = self
            .client
            .get(endpoint_url(&self.endpoint, ""))
            .send()
            .await
            .map_err(|e| BackendError::RequestFailed {
                backend: "neural".into(),
                reason: format!("{}: {e}", self.endpoint),
            })?;
        if !resp.status().is_success() {
            return Err(BackendError::RequestFailed {
                backend: "neural".into(),
                reason: format!("server returned {}", resp.status()),
            });
        }
        tracing::info!(endpoint = %self.endpoint, "Connected to speech server");
        self.ready = true;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.ready = false;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn synthesize(
        &mut self,
        params: &SynthesisParams,
    ) -> Result<SynthesisOutput, BackendError> {
        let mut query = vec![("text", params.text.clone())];
        if params.voice != DEFAULT_VOICE {
            query.push(("speaker_id", params.voice.clone()));
        }

        let resp = self
            .client
            .get(endpoint_url(&self.endpoint, "api/tts"))
            .query(&query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::RequestFailed {
                backend: "neural".into(),
                reason: format!("HTTP {status}"),
            });
        }

        let wav = resp.bytes().await?.to_vec();
        let wav = scale_wav_volume(wav, params.volume);
        finish_artifact(wav, params, "neural").await
    }

    fn available_voices(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_num_threads(&mut self, _num_threads: usize) {}

    fn num_threads(&self) -> usize {
        0
    }
}

/// On-device CLI engine in the piper mould: text on stdin, WAV file out.
pub struct ProcessSynthesis {
    executable: String,
    timeout: Duration,
    model: Option<PathBuf>,
    num_threads: usize,
}

impl ProcessSynthesis {
    pub fn new(executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
            model: None,
            num_threads: 1,
        }
    }
}

#[async_trait]
impl SynthesisBackend for ProcessSynthesis {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn initialize(&mut self, model_path: &Path) -> Result<(), BackendError> {
        if !model_path.exists() {
            return Err(BackendError::RequestFailed {
                backend: self.executable.clone(),
                reason: format!("voice model not found: {}", model_path.display()),
            });
        }
        self.model = Some(model_path.to_path_buf());
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.model = None;
    }

    fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    async fn synthesize(
        &mut self,
        params: &SynthesisParams,
    ) -> Result<SynthesisOutput, BackendError> {
        let model = self.model.as_ref().ok_or_else(|| BackendError::NotLoaded {
            backend: "process".into(),
        })?;

        let wav_path = params.output_path.with_extension("wav");
        let mut args: Vec<String> = path_arg("--model", model).into();
        args.extend(path_arg("--output_file", &wav_path));
        args.extend([
            "--length_scale".to_string(),
            format!("{:.3}", 1.0 / params.speed.max(0.1)),
        ]);
        if let Ok(speaker) = params.voice.parse::<u32>() {
            args.extend(["--speaker".to_string(), speaker.to_string()]);
        }
        let envs = [("OMP_NUM_THREADS".to_string(), self.num_threads.to_string())];

        let rendered = async {
            run_once(
                &self.executable,
                &args,
                &envs,
                params.text.as_bytes(),
                self.timeout,
            )
            .await?;
            Ok::<_, BackendError>(tokio::fs::read(&wav_path).await?)
        }
        .await;
        let wav = match rendered {
            Ok(wav) => wav,
            Err(e) => {
                let _ = tokio::fs::remove_file(&wav_path).await;
                return Err(e);
            }
        };
        if wav_path != params.output_path {
            let _ = tokio::fs::remove_file(&wav_path).await;
        }
        let wav = scale_wav_volume(wav, params.volume);
        finish_artifact(wav, params, "process").await
    }

    fn available_voices(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_num_threads(&mut self, num_threads: usize) {
        self.num_threads = num_threads.max(1);
    }

    fn num_threads(&self) -> usize {
        self.num_threads
    }
}

const MOCK_VOICES: [(&str, f32); 2] = [("mock-neutral", 220.0), ("mock-bright", 440.0)];
/// Spoken length per word at speed 1.0.
const MOCK_WORD_MS: f32 = 300.0;

/// Deterministic sine-tone engine.
pub struct MockSynthesis {
    latency: Duration,
    ready: bool,
    num_threads: usize,
}

impl MockSynthesis {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ready: false,
            num_threads: 1,
        }
    }
}

#[async_trait]
impl SynthesisBackend for MockSynthesis {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn initialize(&mut self, _model_path: &Path) -> Result<(), BackendError> {
        self.ready = true;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.ready = false;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn synthesize(
        &mut self,
        params: &SynthesisParams,
    ) -> Result<SynthesisOutput, BackendError> {
        if !self.ready {
            return Err(BackendError::NotLoaded {
                backend: "mock".into(),
            });
        }
        if params.text.trim().is_empty() {
            return Err(BackendError::InvalidParameters("text is empty".into()));
        }

        let voice = if params.voice == DEFAULT_VOICE {
            MOCK_VOICES[0].0
        } else {
            params.voice.as_str()
        };
        let base_hz = MOCK_VOICES
            .iter()
            .find(|(name, _)| *name == voice)
            .map(|(_, hz)| *hz)
            .ok_or_else(|| BackendError::InvalidParameters(format!("unknown voice: {voice}")))?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let words = params.text.split_whitespace().count() as f32;
        let duration_ms = (words * MOCK_WORD_MS / params.speed.max(0.1)).round();
        let frequency = base_hz * params.pitch.max(0.1);
        let amplitude = 0.3 * params.volume.clamp(0.0, 1.0) * f32::from(i16::MAX);

        let sample_count = (duration_ms as u64 * u64::from(params.sample_rate) / 1000) as usize;
        let samples: Vec<i16> = (0..sample_count)
            .map(|n| {
                let t = n as f32 / params.sample_rate as f32;
                (amplitude * (TAU * frequency * t).sin()) as i16
            })
            .collect();

        let wav = encode_wav(&samples, params.sample_rate);
        finish_artifact(wav, params, "mock").await
    }

    fn available_voices(&self) -> Vec<String> {
        MOCK_VOICES.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn set_num_threads(&mut self, num_threads: usize) {
        self.num_threads = num_threads.max(1);
    }

    fn num_threads(&self) -> usize {
        self.num_threads
    }
}

/// Convert to the requested container and write it to the output path.
async fn finish_artifact(
    wav: Vec<u8>,
    params: &SynthesisParams,
    backend: &str,
) -> Result<SynthesisOutput, BackendError> {
    let info = parse_wav(&wav).ok_or_else(|| BackendError::InvalidResponse {
        backend: backend.to_string(),
        reason: "engine did not produce a PCM WAV file".into(),
    })?;
    let duration_ms = info.duration_ms();

    let audio = match params.format {
        AudioFormat::Wav => wav,
        AudioFormat::Pcm => wav[info.data_offset..info.data_offset + info.data_len].to_vec(),
    };
    tokio::fs::write(&params.output_path, &audio).await?;

    Ok(SynthesisOutput {
        path: params.output_path.clone(),
        audio,
        duration_ms,
    })
}

/// 16-bit mono PCM WAV.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct WavInfo {
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    data_offset: usize,
    data_len: usize,
}

impl WavInfo {
    fn duration_ms(&self) -> u64 {
        let bytes_per_second = u64::from(self.sample_rate)
            * u64::from(self.channels)
            * u64::from(self.bits_per_sample / 8);
        if bytes_per_second == 0 {
            0
        } else {
            self.data_len as u64 * 1000 / bytes_per_second
        }
    }
}

/// Walk the RIFF chunks for `fmt ` and `data`.
fn parse_wav(bytes: &[u8]) -> Option<WavInfo> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }

    let u16_at = |at: usize| Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?));
    let u32_at = |at: usize| Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?));

    let mut format = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let len = u32_at(offset + 4)? as usize;
        let body = offset + 8;
        match id {
            b"fmt " => {
                format = Some((u16_at(body + 2)?, u32_at(body + 4)?, u16_at(body + 14)?));
            }
            b"data" => {
                let (channels, sample_rate, bits_per_sample) = format?;
                return Some(WavInfo {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: body,
                    data_len: len.min(bytes.len() - body),
                });
            }
            _ => {}
        }
        offset = body + len + (len % 2);
    }
    None
}

/// Apply a linear gain to 16-bit samples. Other layouts pass through.
fn scale_wav_volume(mut wav: Vec<u8>, volume: f32) -> Vec<u8> {
    if (volume - 1.0).abs() < f32::EPSILON {
        return wav;
    }
    let Some(info) = parse_wav(&wav) else {
        return wav;
    };
    if info.bits_per_sample != 16 {
        return wav;
    }
    let gain = volume.max(0.0);
    let data = &mut wav[info.data_offset..info.data_offset + info.data_len];
    for chunk in data.chunks_exact_mut(2) {
        let sample = f32::from(i16::from_le_bytes([chunk[0], chunk[1]])) * gain;
        let scaled = sample.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        chunk.copy_from_slice(&scaled.to_le_bytes());
    }
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dir: &Path, text: &str) -> SynthesisParams {
        SynthesisParams {
            text: text.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            speed: 1.0,
            pitch: 1.0,
            volume: 1.0,
            format: AudioFormat::Wav,
            sample_rate: 16_000,
            output_path: dir.join("out.wav"),
        }
    }

    #[test]
    fn wav_header_round_trip() {
        let wav = encode_wav(&[0; 16_000], 16_000);
        let info = parse_wav(&wav).unwrap();
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.channels, 1);
        assert_eq!(info.data_offset, 44);
        assert_eq!(info.duration_ms(), 1000);
        assert!(parse_wav(b"not audio").is_none());
    }

    #[test]
    fn volume_scaling_clamps() {
        let wav = encode_wav(&[20_000, -20_000], 8_000);
        let louder = scale_wav_volume(wav, 2.0);
        let data = &louder[44..];
        assert_eq!(i16::from_le_bytes([data[0], data[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([data[2], data[3]]), i16::MIN);
    }

    #[tokio::test]
    async fn mock_writes_wav_with_expected_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MockSynthesis::new(Duration::ZERO);
        backend.initialize(Path::new("unused")).await.unwrap();

        let output = backend
            .synthesize(&params(dir.path(), "three short words"))
            .await
            .unwrap();
        assert_eq!(output.duration_ms, 900);
        assert!(output.path.exists());
        assert_eq!(std::fs::read(&output.path).unwrap(), output.audio);
    }

    #[tokio::test]
    async fn mock_speed_and_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MockSynthesis::new(Duration::ZERO);
        backend.initialize(Path::new("unused")).await.unwrap();

        let mut request = params(dir.path(), "two words");
        request.speed = 2.0;
        request.format = AudioFormat::Pcm;
        request.output_path = dir.path().join("out.pcm");
        let output = backend.synthesize(&request).await.unwrap();
        assert_eq!(output.duration_ms, 300);
        // 300 ms at 16 kHz, 2 bytes per sample, no header.
        assert_eq!(output.audio.len(), 4800 * 2);
    }

    #[tokio::test]
    async fn mock_rejects_unknown_voice() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = MockSynthesis::new(Duration::ZERO);
        backend.initialize(Path::new("unused")).await.unwrap();

        let mut request = params(dir.path(), "hello");
        request.voice = "baritone".into();
        assert!(matches!(
            backend.synthesize(&request).await,
            Err(BackendError::InvalidParameters(_))
        ));
        assert!(!request.output_path.exists());
    }

    #[test]
    fn factory_applies_thread_count() {
        let store = crate::config::ConfigStore::new();
        store.initialize(None).unwrap();
        store.set_worker_config(crate::config::WorkerKind::CpuTts, "num_threads", 6);
        let settings = TtsSettings::from_store(&store);
        let backend = create_synthesis_backend(&settings).unwrap();
        assert_eq!(backend.name(), "mock");
        assert_eq!(backend.num_threads(), 6);
        assert!(backend.available_voices().contains(&"mock-bright".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_failure_removes_partial_wav() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let engine = dir.path().join("engine.sh");
        std::fs::write(
            &engine,
            r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "--output_file" ]; then out="$2"; fi
  shift
done
cat > /dev/null
printf 'RIFF' > "$out"
exit 1
"#,
        )
        .unwrap();
        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut backend =
            ProcessSynthesis::new(engine.display().to_string(), Duration::from_secs(5));
        backend.initialize(&engine).await.unwrap();

        let mut request = params(dir.path(), "half a sentence");
        request.format = AudioFormat::Pcm;
        request.output_path = dir.path().join("out.pcm");
        assert!(matches!(
            backend.synthesize(&request).await,
            Err(BackendError::RequestFailed { .. })
        ));
        assert!(!dir.path().join("out.wav").exists());
        assert!(!request.output_path.exists());
    }

    #[tokio::test]
    async fn process_requires_model_file() {
        let mut backend = ProcessSynthesis::new("piper", Duration::from_secs(1));
        assert!(backend.initialize(Path::new("/nonexistent/voice.onnx")).await.is_err());
        assert!(!backend.is_ready());
    }
}
