use std::io;
use std::path::Path;

/// Name of the per-file stream holding the metadata JSON.
pub const STREAM_NAME: &str = "snapchat_metadata";

/// Attach `payload` to the file as an alternate data stream (Windows) or extended
/// attribute (Unix). Fails on filesystems without per-file streams.
#[cfg(windows)]
pub fn write_side_stream(path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut stream_path = path.as_os_str().to_owned();
    stream_path.push(":");
    stream_path.push(STREAM_NAME);
    std::fs::write(stream_path, payload)
}

#[cfg(unix)]
pub fn write_side_stream(path: &Path, payload: &[u8]) -> io::Result<()> {
    xattr::set(path, format!("user.{}", STREAM_NAME), payload)
}

#[cfg(not(any(unix, windows)))]
pub fn write_side_stream(_path: &Path, _payload: &[u8]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "per-file streams are not supported on this platform",
    ))
}

#[cfg(windows)]
pub fn read_side_stream(path: &Path) -> io::Result<Option<Vec<u8>>> {
    let mut stream_path = path.as_os_str().to_owned();
    stream_path.push(":");
    stream_path.push(STREAM_NAME);
    match std::fs::read(stream_path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
pub fn read_side_stream(path: &Path) -> io::Result<Option<Vec<u8>>> {
    xattr::get(path, format!("user.{}", STREAM_NAME))
}

#[cfg(not(any(unix, windows)))]
pub fn read_side_stream(_path: &Path) -> io::Result<Option<Vec<u8>>> {
    Ok(None)
}
