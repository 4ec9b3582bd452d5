//! PCM tee for output debugging
//!
//! Wraps any [`StreamOut`] and mirrors every written byte to a raw PCM
//! file before forwarding. Write failures on the dump file are logged
//! once and the tee degrades to a plain passthrough; audio never fails
//! because a disk filled up.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::AudioResult;
use crate::hal::StreamOut;
use crate::params::ParameterMap;
use crate::types::PcmSpec;

pub struct DumpStreamOut {
    inner: Box<dyn StreamOut>,
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl DumpStreamOut {
    pub fn create(inner: Box<dyn StreamOut>, path: &Path) -> DumpStreamOut {
        let file = match File::create(path) {
            Ok(f) => {
                let spec = inner.spec();
                log::info!(
                    "dumping output to {} ({} Hz, {:?}, {:?})",
                    path.display(),
                    spec.sample_rate,
                    spec.format,
                    spec.layout
                );
                Some(BufWriter::new(f))
            }
            Err(e) => {
                log::warn!("cannot create dump file {}: {}", path.display(), e);
                None
            }
        };
        DumpStreamOut {
            inner,
            path: path.to_path_buf(),
            file,
        }
    }
}

impl StreamOut for DumpStreamOut {
    fn spec(&self) -> PcmSpec {
        self.inner.spec()
    }

    fn buffer_frames(&self) -> usize {
        self.inner.buffer_frames()
    }

    fn latency_ms(&self) -> u32 {
        self.inner.latency_ms()
    }

    fn write(&mut self, data: &[u8]) -> AudioResult<usize> {
        let written = self.inner.write(data)?;
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(&data[..written]) {
                log::warn!("dump to {} stopped: {}", self.path.display(), e);
                self.file = None;
            }
        }
        Ok(written)
    }

    fn render_position(&self) -> u64 {
        self.inner.render_position()
    }

    fn standby(&mut self) -> AudioResult<()> {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        self.inner.standby()
    }

    fn set_parameters(&mut self, params: &ParameterMap) -> AudioResult<()> {
        self.inner.set_parameters(params)
    }

    fn get_parameters(&self, keys: &[&str]) -> ParameterMap {
        self.inner.get_parameters(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::stub::StubDevice;
    use crate::hal::HalDevice;
    use crate::types::{AudioFormat, ChannelLayout};

    #[test]
    fn test_dump_mirrors_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcm");
        let spec = PcmSpec {
            sample_rate: 48000,
            format: AudioFormat::Pcm16,
            layout: ChannelLayout::Stereo,
        };
        let inner = StubDevice.open_output(&spec, 16).unwrap();
        let mut tee = DumpStreamOut::create(inner, &path);

        let data: Vec<u8> = (0..64).collect();
        tee.write(&data).unwrap();
        tee.standby().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_unwritable_path_degrades_to_passthrough() {
        let spec = PcmSpec {
            sample_rate: 48000,
            format: AudioFormat::Pcm16,
            layout: ChannelLayout::Stereo,
        };
        let inner = StubDevice.open_output(&spec, 16).unwrap();
        let mut tee = DumpStreamOut::create(inner, Path::new("/nonexistent/dir/out.pcm"));
        assert_eq!(tee.write(&[0u8; 64]).unwrap(), 64);
    }
}
