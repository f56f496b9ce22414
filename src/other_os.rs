use std::{fs, os::unix::fs::FileTypeExt, path::PathBuf, str::FromStr};
use tracing::warn;

use crate::Args;

/// All this platform tells us about the path under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceKind {
    ImageFile,
    /// A block or character device node (raw disks are the latter on BSDs).
    DeviceNode,
}

#[derive(Debug, Clone)]
pub(crate) struct ValidDevice {
    pub path: PathBuf,
    pub kind: DeviceKind,
}

impl FromStr for ValidDevice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = PathBuf::from(s);
        let file_type = fs::metadata(&path)?.file_type();
        let kind = if file_type.is_file() {
            DeviceKind::ImageFile
        } else if file_type.is_block_device() || file_type.is_char_device() {
            DeviceKind::DeviceNode
        } else {
            anyhow::bail!("The device under test must be a device node or an image file.");
        };
        Ok(Self { path, kind })
    }
}

impl ValidDevice {
    /// There is no way to ask for the physical block size here.
    pub(crate) fn default_block_size(&self) -> usize {
        4096
    }
}

pub(crate) fn sanity_checks(args: &Args, target: &ValidDevice) -> anyhow::Result<()> {
    let device_path = &target.path;
    match target.kind {
        DeviceKind::ImageFile => {
            warn!(?device_path, "Not a device; testing it as an image file.");
            Ok(())
        }
        DeviceKind::DeviceNode if args.i_know_what_im_doing_let_me_skip_sanity_checks => {
            warn!(?device_path, "Skipping sanity checks on this platform.");
            Ok(())
        }
        DeviceKind::DeviceNode => {
            anyhow::bail!("I have no way to run sanity checks on this platform. Run with --i-know-what-im-doing-let-me-skip-sanity-checks if you want to destroy {:?} anyway.", device_path);
        }
    }
}
