//! Helpers for filesystem manipulations

use crate::errors::{Result, Error};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Normalizes a path.
///
/// The following operations are performed:
///
/// 1. Sequences of multiple `'/'` characters are collapsed into a single `'/'`.
/// 2. Any leading `'/'` is stripped. (If the request path doesn’t lead with a
///    slash, the path is ill-formed for our purposes and we return an `Err`).
/// 3. Percent-encoded bytes are decoded. Bogus percent-encoding, like `b"%bo"`,
///    will return `Err`.
pub fn normalize_path(path: &[u8]) -> Result<Vec<u8>> {
    // Check for a leading `'/'`
    if path.first() != Some(&0x2F) {
        return Err(Error::PathNotInOriginForm);
    }

    let mut buffer = Vec::with_capacity(path.len() - 1);
    let mut i = 1;

    // skip leading '/' characters
    while i < path.len() && path[i] == 0x2F {
        i += 1;
    }

    while i < path.len() {
        match path[i] {
            // '/'
            0x2F => {
                buffer.push(0x2F);
                while i < path.len() && path[i] == 0x2F {
                    i += 1;
                }
            },
            // '%'
            0x25 => {
                if i + 2 >= path.len() {
                    return Err(Error::IllegalPercentEncoding);
                }

                let high_nybble = path[i + 1];
                let low_nybble = path[i + 2];

                if !is_hexit(high_nybble) || !is_hexit(low_nybble) {
                    return Err(Error::IllegalPercentEncoding);
                }

                buffer.push(from_hexit(high_nybble) << 4 |
                            from_hexit(low_nybble));

                i += 3;
            },
            b => {
                buffer.push(b);
                i += 1;
            }
        }
    }

    Ok(buffer)
}

/// Reduces an uploaded filename to a bare name that is safe to create inside
/// an upload directory.
///
/// Directory components are stripped for both `/` and `\`, whatever the host
/// platform, because browsers on Windows send full client-side paths. A name
/// carrying a `..` component anywhere is refused outright rather than
/// stripped, as is anything that ends up empty, `.`, `..`, or holding a NUL.
pub fn sanitize_filename(raw: &str) -> Result<String> {
    if raw.split(is_separator).any(|component| component == "..") {
        return Err(Error::UnsafePath(
            format!("{:?} contains a parent-directory component", raw)));
    }

    let name = match raw.rfind(is_separator) {
        Some(index) => &raw[index + 1 ..],
        None => raw
    };

    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::UnsafePath(
            format!("{:?} has no usable file name", raw)));
    }

    if name.contains(is_separator) || name.contains('\0') {
        return Err(Error::UnsafePath(
            format!("{:?} still contains a separator", raw)));
    }

    Ok(name.to_owned())
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\' || std::path::is_separator(c)
}

/// A fixed directory that receives uploaded files
#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf
}

impl UploadDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> UploadDir {
        UploadDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `contents` under the sanitized form of `raw_filename`,
    /// replacing any earlier upload of the same name.
    ///
    /// A symlink already sitting at the destination is never followed.
    pub fn store(&self, raw_filename: &str, contents: &[u8]) -> Result<PathBuf> {
        let name = sanitize_filename(raw_filename)?;
        let destination = self.root.join(&name);

        if destination.parent() != Some(self.root.as_path()) {
            return Err(Error::UnsafePath(
                format!("{:?} resolved outside {:?}", raw_filename, self.root)));
        }

        fs::create_dir_all(&self.root)?;
        let opened = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(&destination);
        let mut file = match opened {
            Ok(file) => file,
            Err(ref e) if e.raw_os_error() == Some(nix::libc::ELOOP) =>
                return Err(Error::UnsafePath(
                    format!("{:?} is a symlink", destination))),
            Err(e) => return Err(Error::Io(e))
        };
        file.write_all(contents)?;

        debug!("Stored upload {:?} ({} bytes)", destination, contents.len());
        Ok(destination)
    }
}


/// Returns `true` iff the byte is a hexadecimal digit according to ASCII
fn is_hexit(x: u8) -> bool {
    x.is_ascii_hexdigit()
}

/// Converts from a hexadecimal digit to its value
fn from_hexit(x: u8) -> u8 {
    match x {
        b'0' ..= b'9' => x - b'0',
        b'A' ..= b'F' => x - b'A' + 10,
        b'a' ..= b'f' => x - b'a' + 10,
        _ => panic!("Contract violation: from_hexit expected a hexit, got 0x{:X}", x)
    }
}

#[test]
fn from_hexit_works() {
    for x in 0x0 .. 0x10 {
        assert_eq!(from_hexit(char::from_digit(x, 16).unwrap() as u8), x as u8);
    }
}
