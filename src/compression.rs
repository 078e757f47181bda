//! Cache codecs. Every blob in the cache directory is written through one of
//! these, selected once at startup and recorded per cell.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::{Read, Write},
    str::FromStr,
};

/// The codec used for artifact blobs, pages and snapshots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Lzma,
    Bz2,
    None,
}

impl Compression {
    pub const ALL: &'static [Compression] =
        &[Compression::Gzip, Compression::Lzma, Compression::Bz2, Compression::None];

    /// Wraps a writer with the selected encoder. Compression level is kept
    /// low; the cache trades ratio for throughput.
    pub fn wrap_writer<'a, W: Write + 'a>(self, writer: W) -> Box<dyn Write + 'a> {
        match self {
            Compression::Gzip => {
                Box::new(flate2::write::GzEncoder::new(writer, flate2::Compression::fast()))
            }
            Compression::Lzma => Box::new(xz2::write::XzEncoder::new(writer, 1)),
            Compression::Bz2 => {
                Box::new(bzip2::write::BzEncoder::new(writer, bzip2::Compression::fast()))
            }
            Compression::None => Box::new(writer),
        }
    }

    pub fn wrap_reader<'a, R: Read + 'a>(self, reader: R) -> Box<dyn Read + 'a> {
        match self {
            Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
            Compression::Lzma => Box::new(xz2::read::XzDecoder::new(reader)),
            Compression::Bz2 => Box::new(bzip2::read::BzDecoder::new(reader)),
            Compression::None => Box::new(reader),
        }
    }

    /// Encodes a value as compressed JSON.
    pub fn encode<T: Serialize>(self, value: &T) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        {
            let mut writer = self.wrap_writer(&mut out);
            serde_json::to_writer(&mut writer, value)?;
            writer.flush()?;
        }
        Ok(out)
    }

    /// Decodes a value previously written by [`Compression::encode`].
    pub fn decode<T: serde::de::DeserializeOwned>(self, bytes: &[u8]) -> std::io::Result<T> {
        let mut reader = self.wrap_reader(bytes);
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Gzip => "gzip",
            Compression::Lzma => "lzma",
            Compression::Bz2 => "bz2",
            Compression::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "lzma" => Ok(Compression::Lzma),
            "bz2" => Ok(Compression::Bz2),
            "none" => Ok(Compression::None),
            other => Err(format!("unknown compression \"{other}\", expected one of gzip, lzma, bz2, none")),
        }
    }
}
