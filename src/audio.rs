//! Audio I/O and DSP.
//!
//! Everything here works on plain `f64` sample buffers on the CPU; the
//! [`crate::features`] module turns the results into tensors.

pub mod envelope;
pub mod hilbert;
pub mod mel;
pub mod pitch;
pub mod stft;
mod wav;

pub use envelope::EnvelopeAnalyzer;
pub use hilbert::{analytic_envelope_phase, hilbert_transform, process_spectrogram_with_hilbert};
pub use mel::{MelConfig, MelSpectrogram, mfcc};
pub use pitch::{F0Track, PitchConfig, PitchTracker, detect_pitch_frequency};
pub use stft::{PadMode, Stft, StftConfig, WindowKind, spectrogram};
pub use wav::{downmix, load_mono, read_wav, resample, write_wav};
