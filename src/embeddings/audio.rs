// audio.rs — Audio file → 16 kHz mono f32 PCM, plus the mel filterbank Whisper expects.
//
// symphonia demuxes/decodes (format picked from the file extension, then probed),
// channels are averaged to mono, rubato resamples to the model rate.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config;

/// Decode an audio file to mono samples at `config::speech::SAMPLE_RATE`.
pub fn load_pcm_mono_16k(path: &Path) -> anyhow::Result<Vec<f32>> {
    let (samples, sample_rate) = decode_mono(path)?;
    log::debug!(
        "Decoded {} samples at {} Hz from {}",
        samples.len(),
        sample_rate,
        path.display()
    );
    resample(samples, sample_rate, config::speech::SAMPLE_RATE)
}

/// Decode the first audio track of a file, averaging all channels.
pub fn decode_mono(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("unsupported or corrupt audio container")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("no audio track found")?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.context("audio track has no sample rate")?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("unsupported audio codec")?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).context("read audio packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // Corrupt frames are skipped, like ffmpeg does.
            Err(SymphoniaError::DecodeError(msg)) => {
                log::warn!("Skipping undecodable audio frame: {}", msg);
                continue;
            }
            Err(e) => return Err(e).context("decode audio packet"),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend(
            buf.samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    Ok((samples, sample_rate))
}

/// Resample mono PCM. Same-rate input is returned untouched.
pub fn resample(samples: Vec<f32>, from_rate: u32, to_rate: u32) -> anyhow::Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        bail!("invalid sample rate conversion {from_rate} -> {to_rate}");
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples);
    }

    let params = SincInterpolationParameters {
        sinc_len: config::speech::RESAMPLER_SINC_LEN,
        f_cutoff: config::speech::RESAMPLER_F_CUTOFF,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: config::speech::RESAMPLER_OVERSAMPLING,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1).context("create resampler")?;
    let delay = resampler.output_delay();

    let mut out = first_channel(resampler.process(&[samples], None).context("resample audio")?);
    // The sinc filter lags by `delay` frames; push zeros through until the
    // last input sample has come out.
    while out.len() < delay + expected {
        let tail = first_channel(
            resampler
                .process_partial(None::<&[Vec<f32>]>, None)
                .context("flush resampler")?,
        );
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }

    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    Ok(out)
}

fn first_channel(channels: Vec<Vec<f32>>) -> Vec<f32> {
    channels.into_iter().next().unwrap_or_default()
}

/// Slaney-style mel filterbank, row-major `[n_mels][n_fft / 2 + 1]`.
///
/// Matches `librosa.filters.mel(sr, n_fft, n_mels)` (htk=False, norm="slaney"),
/// which is how Whisper's bundled filters were produced.
pub fn mel_filters(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sample_rate as f64 / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let lower = (f - left) / (center - left);
            let upper = (right - f) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[m * n_freqs + k] = (weight * enorm) as f32;
        }
    }
    filters
}

const MEL_F_SP: f64 = 200.0 / 3.0;
const MEL_MIN_LOG_HZ: f64 = 1000.0;
const MEL_MIN_LOG_MEL: f64 = MEL_MIN_LOG_HZ / MEL_F_SP;

fn mel_log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MEL_MIN_LOG_HZ {
        MEL_MIN_LOG_MEL + (hz / MEL_MIN_LOG_HZ).ln() / mel_log_step()
    } else {
        hz / MEL_F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MEL_MIN_LOG_MEL {
        MEL_MIN_LOG_HZ * (mel_log_step() * (mel - MEL_MIN_LOG_MEL)).exp()
    } else {
        MEL_F_SP * mel
    }
}
