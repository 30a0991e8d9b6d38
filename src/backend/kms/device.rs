use std::{
    fs::OpenOptions,
    io,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use smithay::{
    backend::{
        drm::{DrmDeviceFd, DrmNode, NodeType},
        udev::all_gpus,
    },
    reexports::drm::control::{Device as ControlDevice, ResourceHandles},
    utils::DeviceFd,
};

use crate::{DisplayError, Result};

const DRI_DIR: &str = "/dev/dri";

/// An open KMS-capable DRM node.
#[derive(Debug, Clone)]
pub struct KmsDevice {
    fd: DrmDeviceFd,
    path: PathBuf,
}

impl KmsDevice {
    pub fn fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open `path`, or the first primary node that answers a KMS resource query.
pub fn open_device(path: Option<&Path>) -> Result<(KmsDevice, ResourceHandles)> {
    match path {
        Some(path) => open_explicit(path),
        None => {
            let candidates = candidate_nodes();
            tracing::debug!(?candidates, "trying drm nodes");
            first_accepted(candidates, |path| try_node(&path)).ok_or(DisplayError::NoDeviceFound)
        }
    }
}

fn open_explicit(path: &Path) -> Result<(KmsDevice, ResourceHandles)> {
    let fd = open_node(path).map_err(|err| DisplayError::kernel("open", err))?;
    match fd.resource_handles() {
        Ok(resources) => {
            tracing::info!(path = %path.display(), "using drm device");
            Ok((
                KmsDevice {
                    fd,
                    path: path.to_owned(),
                },
                resources,
            ))
        }
        Err(err) if err.raw_os_error() == Some(libc::EOPNOTSUPP) => {
            Err(DisplayError::NotAModesetDevice {
                path: path.to_owned(),
            })
        }
        Err(err) => Err(DisplayError::kernel("drmModeGetResources", err)),
    }
}

fn try_node(path: &Path) -> Option<(KmsDevice, ResourceHandles)> {
    let fd = match open_node(path) {
        Ok(fd) => fd,
        Err(err) => {
            tracing::debug!(path = %path.display(), "skipping drm node: {err}");
            return None;
        }
    };
    match fd.resource_handles() {
        Ok(resources) => {
            tracing::info!(path = %path.display(), "using drm device");
            Some((
                KmsDevice {
                    fd,
                    path: path.to_owned(),
                },
                resources,
            ))
        }
        Err(err) => {
            tracing::debug!(path = %path.display(), "not a kms device: {err}");
            None
        }
    }
}

/// Run `accept` over `candidates` in order and return the first success.
///
/// Rejected candidates are dropped, and with them any fd that was opened, before the
/// next one is tried.
pub fn first_accepted<C, T>(
    candidates: impl IntoIterator<Item = C>,
    mut accept: impl FnMut(C) -> Option<T>,
) -> Option<T> {
    candidates.into_iter().find_map(|candidate| accept(candidate))
}

fn open_node(path: &Path) -> io::Result<DrmDeviceFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)?;
    Ok(DrmDeviceFd::new(DeviceFd::from(std::os::fd::OwnedFd::from(file))))
}

/// Primary DRM nodes, udev order first, `/dev/dri` scan if udev has nothing.
fn candidate_nodes() -> Vec<PathBuf> {
    let seat = std::env::var("XDG_SEAT").unwrap_or_else(|_| "seat0".to_owned());
    let from_udev = match all_gpus(&seat) {
        Ok(paths) => paths,
        Err(err) => {
            tracing::warn!(%seat, "udev gpu enumeration failed: {err}");
            Vec::new()
        }
    };

    let primary = primary_nodes(from_udev);
    if !primary.is_empty() {
        return primary;
    }

    let mut scanned = match std::fs::read_dir(DRI_DIR) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .collect::<Vec<_>>(),
        Err(err) => {
            tracing::warn!("failed to scan {DRI_DIR}: {err}");
            Vec::new()
        }
    };
    scanned.sort();
    primary_nodes(scanned)
}

fn primary_nodes(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|path| {
            DrmNode::from_path(path)
                .map(|node| node.ty() == NodeType::Primary)
                .unwrap_or(false)
        })
        .collect()
}
