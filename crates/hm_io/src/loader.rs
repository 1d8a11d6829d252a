use crate::parser::parse_image;
use anyhow::{Context, Result, bail};
use hm_core::image::DeviceImage;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Leading bytes of a vendor binary container.
const XCLBIN_MAGIC: &[u8] = b"xclbin2";

/// Loads a hardware image descriptor from disk.
///
/// Vendor binary containers cannot be programmed onto the simulated device
/// and are rejected. An image without an `image` directive is named after
/// the file stem.
///
/// # Arguments
///
/// * `path` - Path to the image descriptor
///
/// # Returns
///
/// The validated image, or an error if reading or parsing fails.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DeviceImage> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    if buffer.starts_with(XCLBIN_MAGIC) {
        bail!(
            "{} is a binary xclbin container; the simulated device loads text image descriptors",
            path.display()
        );
    }

    let text = String::from_utf8(buffer)
        .with_context(|| format!("{} is not a UTF-8 image descriptor", path.display()))?;
    let mut image =
        parse_image(&text).with_context(|| format!("Failed to parse image {}", path.display()))?;

    if image.name.is_empty()
        && let Some(stem) = path.file_stem()
    {
        image.name = stem.to_string_lossy().into_owned();
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn scratch(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("hm_io-{}-{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_descriptor_and_names_it_after_file() {
        let path = scratch("unnamed.himg", b"kernel vadd latency_us=5\ncu vadd vadd_1\n");
        let image = load_image(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(image.name, format!("hm_io-{}-unnamed", std::process::id()));
        assert_eq!(image.compute_units.len(), 1);
    }

    #[test]
    fn rejects_binary_container() {
        let path = scratch("vadd.xclbin", b"xclbin2\0\0\0\x01\x02");
        let err = load_image(&path).unwrap_err();
        fs::remove_file(&path).unwrap();

        assert!(err.to_string().contains("binary xclbin container"), "{}", err);
    }

    #[test]
    fn parse_errors_carry_file_and_line() {
        let path = scratch("broken.himg", b"kernel vadd\nbogus line\n");
        let err = load_image(&path).unwrap_err();
        fs::remove_file(&path).unwrap();

        let text = format!("{:#}", err);
        assert!(text.contains("broken.himg"), "{}", text);
        assert!(text.contains("line 2:"), "{}", text);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_image("/nonexistent/hm_io/image.himg").is_err());
    }
}
