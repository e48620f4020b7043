//! Payload samples: the uplink application-layer bytes a device ships,
//! loaded from binary sample files under `DataPathS`/`DataPathL` and
//! selected by `(deviceType, dataType, axisId)`.
//!
//! Grounded on `original_source/simulator/components/device/frames/uplink/uplink.go`'s
//! `ReadDataSample`/`GetDataSample`: a scalar stream under `DataPathS` for
//! simple devices, and a `DataPathL/<subtype>/` directory of per-axis
//! samples for richer (vibration/spectral) device types. Mirroring the Go
//! original's `defer file.Close()`-in-a-loop pattern, every file this
//! loader opens is read and dropped within the single loop iteration that
//! opened it: no handle outlives its iteration.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::warn;

/// The authoritative `DataPathL` subtype directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtype {
    PsdRawX,
    PsdRawY,
    PsdRawZ,
    PsdRawTriaxis,
    FftX,
    FftY,
    FftZ,
    FftTriaxis,
    FftRawX,
    FftRawY,
    FftRawZ,
    FftRawTriaxis,
}

impl Subtype {
    pub fn dirname(self) -> &'static str {
        match self {
            Subtype::PsdRawX => "psd_raw_x",
            Subtype::PsdRawY => "psd_raw_y",
            Subtype::PsdRawZ => "psd_raw_z",
            Subtype::PsdRawTriaxis => "psd_raw_triaxis",
            Subtype::FftX => "fft_x",
            Subtype::FftY => "fft_y",
            Subtype::FftZ => "fft_z",
            Subtype::FftTriaxis => "fft_triaxis",
            Subtype::FftRawX => "fft_raw_x",
            Subtype::FftRawY => "fft_raw_y",
            Subtype::FftRawZ => "fft_raw_z",
            Subtype::FftRawTriaxis => "fft_raw_triaxis",
        }
    }

    /// Maps a `(dataType, axisId)` pair from the provisioning catalog onto a
    /// subtype directory. `axisId` follows the catalog's 0=x/1=y/2=z/3=triaxis
    /// convention; unrecognized combinations fall back to `None` so the
    /// caller can decide between a scalar `DataPathS` sample or silence.
    pub fn from_data_type(data_type: &str, axis_id: u8) -> Option<Self> {
        let triaxis = axis_id == 3;
        match (data_type, axis_id, triaxis) {
            ("psd_raw", _, true) => Some(Subtype::PsdRawTriaxis),
            ("psd_raw", 0, _) => Some(Subtype::PsdRawX),
            ("psd_raw", 1, _) => Some(Subtype::PsdRawY),
            ("psd_raw", 2, _) => Some(Subtype::PsdRawZ),
            ("fft", _, true) => Some(Subtype::FftTriaxis),
            ("fft", 0, _) => Some(Subtype::FftX),
            ("fft", 1, _) => Some(Subtype::FftY),
            ("fft", 2, _) => Some(Subtype::FftZ),
            ("fft_raw", _, true) => Some(Subtype::FftRawTriaxis),
            ("fft_raw", 0, _) => Some(Subtype::FftRawX),
            ("fft_raw", 1, _) => Some(Subtype::FftRawY),
            ("fft_raw", 2, _) => Some(Subtype::FftRawZ),
            _ => None,
        }
    }
}

/// A provider handed to a device: produces the next uplink's raw FRMPayload
/// bytes, truncated/sized by the caller against the region's per-DR max.
pub type PayloadProvider = Box<dyn Fn(usize) -> Vec<u8> + Send + Sync>;

/// Resolves `(deviceType, dataType, axisId)` triples to sample bytes under
/// the two configured sample directories.
#[derive(Debug, Clone)]
pub struct SampleLoader {
    data_path_s: PathBuf,
    data_path_l: PathBuf,
}

impl SampleLoader {
    pub fn new(data_path_s: impl Into<PathBuf>, data_path_l: impl Into<PathBuf>) -> Self {
        Self { data_path_s: data_path_s.into(), data_path_l: data_path_l.into() }
    }

    /// Reads the single scalar sample file under `DataPathS` for `device_type`.
    /// The file handle is opened and dropped within this call, never held
    /// across a caller's loop iteration.
    pub fn load_scalar(&self, device_type: &str) -> Option<Vec<u8>> {
        let path = self.data_path_s.join(device_type);
        read_whole_file(&path)
    }

    /// Reads every sample file in `DataPathL/<subtype>/`, concatenating them
    /// in directory order. Each file is opened, read, and dropped before the
    /// next is opened, the Rust equivalent of the Go original's per-file
    /// `defer file.Close()`, made explicit since loops have no implicit
    /// per-iteration scope.
    pub fn load_long(&self, subtype: Subtype) -> Vec<u8> {
        let dir = self.data_path_l.join(subtype.dirname());
        let mut out = Vec::new();
        let Ok(mut entries) = std::fs::read_dir(&dir) else {
            warn!(dir = %dir.display(), "sample directory missing, returning empty sample");
            return out;
        };
        while let Some(Ok(entry)) = entries.next() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            {
                // Scoped block: `file` is dropped at the end of this
                // iteration, before the next entry is opened.
                let Some(bytes) = read_whole_file(&path) else { continue };
                out.extend_from_slice(&bytes);
            }
        }
        out
    }

    /// Builds a provider closure for a device's `(deviceType, dataType,
    /// axisId)` selector. Falls back to a zero-filled buffer sized to the
    /// caller's request when no sample file resolves, so the simulator
    /// keeps running without a populated sample tree.
    pub fn provider_for(&self, device_type: String, data_type: String, axis_id: u8) -> PayloadProvider {
        let loader = self.clone();
        Box::new(move |max_len: usize| {
            let sample = match Subtype::from_data_type(&data_type, axis_id) {
                Some(subtype) => {
                    let bytes = loader.load_long(subtype);
                    if bytes.is_empty() { loader.load_scalar(&device_type) } else { Some(bytes) }
                }
                None => loader.load_scalar(&device_type),
            };
            match sample {
                Some(bytes) => bytes,
                None => vec![0u8; max_len.min(11)],
            }
        })
    }
}

fn read_whole_file(path: &Path) -> Option<Vec<u8>> {
    let mut file = File::open(path).ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    Some(buf)
    // `file` drops here, at the end of this call, never outliving a caller's
    // loop iteration.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtype_maps_axis_and_triaxis() {
        assert_eq!(Subtype::from_data_type("fft", 0).unwrap(), Subtype::FftX);
        assert_eq!(Subtype::from_data_type("fft", 3).unwrap(), Subtype::FftTriaxis);
        assert!(Subtype::from_data_type("unknown", 0).is_none());
    }

    #[test]
    fn scalar_sample_missing_file_is_none() {
        let loader = SampleLoader::new("/nonexistent/s", "/nonexistent/l");
        assert!(loader.load_scalar("temp-sensor").is_none());
    }

    #[test]
    fn long_sample_concatenates_directory_contents() {
        let dir = std::env::temp_dir().join(format!("lwn-sim-payload-test-{}", std::process::id()));
        let sub_dir = dir.join(Subtype::FftX.dirname());
        std::fs::create_dir_all(&sub_dir).unwrap();
        std::fs::write(sub_dir.join("a.bin"), [1u8, 2, 3]).unwrap();
        std::fs::write(sub_dir.join("b.bin"), [4u8, 5]).unwrap();

        let loader = SampleLoader::new(dir.join("s"), &dir);
        let bytes = loader.load_long(Subtype::FftX);
        assert_eq!(bytes.len(), 5);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn provider_falls_back_to_zero_fill_when_unconfigured() {
        let loader = SampleLoader::new("/nonexistent/s", "/nonexistent/l");
        let provider = loader.provider_for("temp-sensor".into(), "unknown".into(), 0);
        let bytes = provider(20);
        assert_eq!(bytes.len(), 11);
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
