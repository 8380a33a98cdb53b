use std::{
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::Path,
    str::FromStr,
};

/// The 128-bit content hash the metadata service reports for an artifact.
///
/// Comparison is on the raw digest, so the case of the hex string a checksum
/// was parsed from never matters.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 16]);

impl Checksum {
    pub fn of_bytes(data: &[u8]) -> Self {
        Checksum(md5::compute(data).0)
    }

    /// Hash a file's contents without reading it all into memory.
    pub fn of_file(path: &Path) -> Result<Self, std::io::Error> {
        let file = File::open(path)?;
        Checksum::of_reader(BufReader::new(file))
    }

    pub fn of_reader(mut reader: impl Read) -> Result<Self, std::io::Error> {
        let mut ctx = md5::Context::new();
        let mut buffer = [0_u8; 8 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            ctx.consume(&buffer[..n]);
        }

        Ok(Checksum(ctx.compute().0))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("\"{0}\" is not a 32 character hex digest")]
pub struct ParseChecksumError(String);

impl FromStr for Checksum {
    type Err = ParseChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut bytes = [0_u8; 16];
        hex::decode_to_slice(trimmed.to_ascii_lowercase(), &mut bytes)
            .map_err(|_| ParseChecksumError(s.to_string()))?;
        Ok(Checksum(bytes))
    }
}
