#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Volume: {0}")]
    Volume(#[from] VolumeError),
    #[error("Digest: {0}")]
    Digest(#[from] DigestError),
}

#[derive(thiserror::Error, Debug)]
pub enum VolumeError {
    #[error("Malformed boot sector: {0}")]
    MalformedBootSector(&'static str),
    #[error("Cluster {0} is not addressable")]
    ClusterOutOfRange(u32),
    #[error("FAT copy {0} does not exist")]
    FatCopyOutOfRange(u32),
}

#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("Digest shall be 40 hexadecimal characters")]
    InvalidHex,
}

pub type Result<T> = core::result::Result<T, Error>;
