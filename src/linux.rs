extern crate block_utils;
use crate::Args;
use std::{fs, os::unix::fs::FileTypeExt, path::PathBuf, str::FromStr};
use tracing::warn;

#[derive(Debug, Clone)]
pub(crate) struct ValidDevice {
    pub path: PathBuf,
    pub partition: Option<u64>,
    /// `None` when testing an image file rather than a block device.
    pub device: Option<block_utils::Device>,
}

impl FromStr for ValidDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = PathBuf::from(s);
        let file_type = fs::metadata(&path)?.file_type();
        if file_type.is_file() {
            return Ok(Self {
                path,
                partition: None,
                device: None,
            });
        }
        if !file_type.is_block_device() {
            anyhow::bail!("The device under test must be a block device or an image file.");
        }
        let (partition, device) = block_utils::get_device_from_path(s)?;
        Ok(Self {
            path,
            partition,
            device: Some(device.ok_or(anyhow::anyhow!(
                "The device under test must be a valid block device."
            ))?),
        })
    }
}

impl ValidDevice {
    /// The block size to test with when none was given.
    pub(crate) fn default_block_size(&self) -> usize {
        self.device
            .as_ref()
            .and_then(|device| device.physical_block_size)
            .and_then(|size| usize::try_from(size).ok())
            .unwrap_or(4096)
    }
}

pub(crate) fn sanity_checks(args: &Args, target: &ValidDevice) -> anyhow::Result<()> {
    let ValidDevice {
        path: device_path,
        partition,
        device,
    } = target;
    if device.is_none() {
        warn!(?device_path, "Not a block device; testing it as an image file.");
        return Ok(());
    }
    if partition.is_some() {
        if !args.allow_any_block_device {
            anyhow::bail!("Device is not a whole disk but a partition - pass --allow-any-block-device to run tests anyway.");
        } else {
            warn!(
                ?partition,
                ?device_path,
                "Testing a partition but running tests anyway."
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::ValidDevice;

    #[test]
    fn image_files_are_accepted() {
        let image = tempfile::NamedTempFile::new().expect("temp file");
        let path = image.path().to_str().expect("utf-8 path");
        let target: ValidDevice = path.parse().expect("valid image");
        assert!(target.device.is_none());
        assert_eq!(target.partition, None);
        assert_eq!(target.default_block_size(), 4096);
    }

    #[test]
    fn directories_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().to_str().expect("utf-8 path");
        assert!(path.parse::<ValidDevice>().is_err());
    }
}
