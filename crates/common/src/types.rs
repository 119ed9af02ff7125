use serde::{Deserialize, Serialize};

/// Byte total carried by a circuit, relay or exit socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteCount(pub u64);

impl ByteCount {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn from_mb(mb: u64) -> Self {
        Self(mb * 1024 * 1024)
    }

    pub fn as_bytes(&self) -> u64 {
        self.0
    }

    pub fn as_kb(&self) -> f64 {
        self.0 as f64 / 1024.0
    }

    pub fn as_mb(&self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }

    pub fn as_gb(&self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl std::fmt::Display for ByteCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 1024 {
            write!(f, "{} B", self.0)
        } else if self.0 < 1024 * 1024 {
            write!(f, "{:.2} KB", self.as_kb())
        } else if self.0 < 1024 * 1024 * 1024 {
            write!(f, "{:.2} MB", self.as_mb())
        } else {
            write!(f, "{:.2} GB", self.as_gb())
        }
    }
}

impl std::ops::Add for ByteCount {
    type Output = ByteCount;

    fn add(self, other: ByteCount) -> ByteCount {
        ByteCount(self.0.saturating_add(other.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_count_conversion() {
        let bytes = ByteCount::from_mb(10);
        assert_eq!(bytes.as_bytes(), 10 * 1024 * 1024);
        assert_eq!(bytes.as_mb(), 10.0);
    }

    #[test]
    fn test_byte_count_display() {
        assert_eq!(ByteCount(512).to_string(), "512 B");
        assert_eq!(ByteCount(2048).to_string(), "2.00 KB");
        assert_eq!(ByteCount::from_mb(55).to_string(), "55.00 MB");
    }
}
