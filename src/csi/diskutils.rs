//! Node-local operations on the Linux block layer: device resolution,
//! formatting, mounting, resizing and LUKS handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use nix::mount::{self, MntFlags, MsFlags};
use nix::sys::stat::{stat, SFlag};
use nix::sys::statfs::statfs;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::luks;
use crate::scaleway;

/// Directory of the stable by-id device symlinks.
pub const DISK_BY_ID_PATH: &str = "/dev/disk/by-id";
/// Prefix of the by-id symlink for a Scaleway block volume.
pub const DISK_PREFIX: &str = "scsi-0SCW_b_ssd_volume-";
/// Directory where LUKS mapper devices appear.
pub const LUKS_MAPPER_PATH: &str = "/dev/mapper";
/// Prefix of the mapper device for an encrypted volume.
pub const LUKS_MAPPER_PREFIX: &str = "scw-luks-";
/// Filesystem used when the capability does not specify one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Stable device path of the volume with the given ID.
pub fn device_path(volume_id: &str) -> PathBuf {
    PathBuf::from(format!("{DISK_BY_ID_PATH}/{DISK_PREFIX}{volume_id}"))
}

/// Mapper device path of the encrypted volume with the given ID.
pub fn mapper_path(volume_id: &str) -> PathBuf {
    PathBuf::from(format!("{LUKS_MAPPER_PATH}/{LUKS_MAPPER_PREFIX}{volume_id}"))
}

fn mapper_name(volume_id: &str) -> String {
    format!("{LUKS_MAPPER_PREFIX}{volume_id}")
}

/// Errors of the disk utilities.
#[derive(Debug, Error)]
pub enum DiskError {
    /// The by-id symlink for the volume does not exist on this node.
    #[error("device for volume {0} not found")]
    DeviceNotFound(String),

    /// The resolved path is not a block device.
    #[error("path {0} does not point on a block device")]
    NotBlockDevice(PathBuf),

    /// The device already carries a filesystem of another type; it is never
    /// reformatted.
    #[error("device {device} is already formatted as {found:?}, not formatting as {wanted:?}")]
    WrongFsType {
        device: PathBuf,
        found: String,
        wanted: String,
    },

    /// In-place growth is only implemented for ext and xfs filesystems.
    #[error("filesystem {0:?} cannot be resized in place")]
    UnsupportedResize(String),

    /// Only ext and xfs filesystems can be created.
    #[error("filesystem {0:?} is not supported")]
    UnsupportedFilesystem(String),

    /// An external tool failed; stdout/stderr are captured in the message.
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("failed to mount {mount_source} on {target}: {errno}")]
    MountFailed {
        mount_source: PathBuf,
        target: PathBuf,
        errno: nix::Error,
    },

    #[error("failed to unmount {target}: {errno}")]
    UnmountFailed { target: PathBuf, errno: nix::Error },

    #[error("stat on {path} failed: {errno}")]
    Stat { path: PathBuf, errno: nix::Error },

    #[error("statfs on {path} failed: {errno}")]
    Statfs { path: PathBuf, errno: nix::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Raw filesystem statistics of a mount point.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub block_size: i64,
    pub blocks_free: u64,
    pub files: u64,
    pub files_free: u64,
}

/// Runs an external command, optionally feeding `stdin`, and returns its
/// output. Spawn failures are reported as [`DiskError::CommandFailed`].
pub(super) async fn run_command(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<Output, DiskError> {
    debug!(program, ?args, "running command");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| DiskError::CommandFailed {
        command: program.to_owned(),
        message: format!("failed to start: {err}"),
    })?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|err| DiskError::CommandFailed {
                    command: program.to_owned(),
                    message: format!("failed to write stdin: {err}"),
                })?;
        }
    }

    child
        .wait_with_output()
        .await
        .map_err(|err| DiskError::CommandFailed {
            command: program.to_owned(),
            message: format!("failed to wait: {err}"),
        })
}

/// Builds a [`DiskError::CommandFailed`] carrying the captured stdout and
/// stderr of a finished command.
pub(super) fn command_error(command: &str, output: &Output) -> DiskError {
    DiskError::CommandFailed {
        command: command.to_owned(),
        message: format!(
            "exit status {:?}, stdout: {}, stderr: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim(),
        ),
    }
}

/// Node-local disk operations needed by the node service.
#[async_trait]
pub trait DiskUtils: Send + Sync {
    /// Mounts `device_path` on `target_path` as `fs_type`, formatting the
    /// device first when it carries no filesystem signature. A device
    /// formatted with another filesystem is never reformatted.
    async fn format_and_mount(
        &self,
        target_path: &Path,
        device_path: &Path,
        fs_type: &str,
        mount_options: &[String],
    ) -> Result<(), DiskError>;

    /// Unmounts and removes the given target. Not mounted is a no-op.
    async fn unmount(&self, target_path: &Path) -> Result<(), DiskError>;

    /// Mounts `source_path` on `target_path` (bind mounts included).
    async fn mount_to_target(
        &self,
        source_path: &Path,
        target_path: &Path,
        fs_type: &str,
        mount_options: &[String],
    ) -> Result<(), DiskError>;

    /// True if `path` resolves to a block device.
    fn is_block_device(&self, path: &Path) -> Result<bool, DiskError>;

    /// Resolves the stable device path of the volume, verifying the target
    /// is a block device.
    fn get_device_path(&self, volume_id: &str) -> Result<PathBuf, DiskError>;

    /// True iff `target_path` is a mount point, using the kernel's view.
    fn is_mounted(&self, target_path: &Path) -> bool;

    /// Filesystem statistics of the given path.
    fn get_statfs(&self, path: &Path) -> Result<FsStats, DiskError>;

    /// Grows the volume in place. When a passphrase is provided the LUKS
    /// mapper device is grown first. No-op when everything is already sized.
    async fn resize(
        &self,
        target_path: &Path,
        device_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), DiskError>;

    /// True if the device carries a LUKS header.
    async fn is_encrypted(&self, device_path: &Path) -> Result<bool, DiskError>;

    /// Encrypts the volume when needed and opens it, returning the mapper
    /// path. Already-open devices are returned as-is.
    async fn encrypt_and_open_device(
        &self,
        volume_id: &str,
        passphrase: &str,
    ) -> Result<PathBuf, DiskError>;

    /// Closes the mapper device when it is open.
    async fn close_device(&self, volume_id: &str) -> Result<(), DiskError>;

    /// Path of the open mapper device for the volume, `None` when not open.
    async fn get_mapped_device_path(&self, volume_id: &str) -> Result<Option<PathBuf>, DiskError>;
}

/// Creates a mount point at `path`: a directory for filesystem mounts, a
/// regular file for raw block binds.
pub async fn create_mount_point(path: &Path, file: bool) -> Result<(), DiskError> {
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(());
    }

    if file {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        drop(
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path)
                .await?,
        );
    } else {
        tokio::fs::create_dir_all(path).await?;
    }

    Ok(())
}

/// Production implementation backed by syscalls and the usual block tools.
#[derive(Default)]
pub struct SysDiskUtils;

impl SysDiskUtils {
    pub fn new() -> Self {
        Self
    }

    /// Splits mount options into kernel mount flags and filesystem data
    /// options.
    fn parse_mount_options(options: &[String]) -> (MsFlags, String) {
        let mut flags = MsFlags::empty();
        let mut data: Vec<&str> = Vec::new();

        for option in options {
            match option.as_str() {
                "bind" => flags |= MsFlags::MS_BIND,
                "ro" => flags |= MsFlags::MS_RDONLY,
                "remount" => flags |= MsFlags::MS_REMOUNT,
                "noatime" => flags |= MsFlags::MS_NOATIME,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                other => data.push(other),
            }
        }

        (flags, data.join(","))
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DiskError> {
        let (flags, data) = Self::parse_mount_options(options);
        let source = source.to_owned();
        let target = target.to_owned();
        let fs_type = fs_type.to_owned();

        tokio::task::spawn_blocking(move || {
            mount::mount(
                Some(source.as_path()),
                target.as_path(),
                (!fs_type.is_empty() && !flags.contains(MsFlags::MS_BIND))
                    .then_some(fs_type.as_str()),
                flags,
                (!data.is_empty()).then_some(data.as_str()),
            )
            .map_err(|errno| DiskError::MountFailed {
                mount_source: source,
                target,
                errno,
            })
        })
        .await
        .map_err(|err| DiskError::CommandFailed {
            command: "mount".to_owned(),
            message: err.to_string(),
        })?
    }

    /// Filesystem signature of the device, `None` when blank. Uses `blkid`;
    /// exit code 2 means no signature was found.
    async fn disk_format(&self, device: &Path) -> Result<Option<String>, DiskError> {
        let device_str = device.display().to_string();
        let args = [
            "-p",
            "-s",
            "TYPE",
            "-s",
            "PTTYPE",
            "-o",
            "export",
            &device_str,
        ];
        let output = run_command("blkid", &args, None).await?;

        if output.status.code() == Some(2) {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(command_error("blkid", &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut fs_type = None;
        let mut pt_type = None;
        for line in stdout.lines() {
            if let Some(value) = line.strip_prefix("TYPE=") {
                fs_type = Some(value.to_owned());
            } else if let Some(value) = line.strip_prefix("PTTYPE=") {
                pt_type = Some(value.to_owned());
            }
        }

        if fs_type.is_none() && pt_type.is_some() {
            return Err(DiskError::CommandFailed {
                command: "blkid".to_owned(),
                message: format!("device {} carries a partition table", device.display()),
            });
        }

        Ok(fs_type)
    }

    async fn format(&self, device: &Path, fs_type: &str) -> Result<(), DiskError> {
        let device_str = device.display().to_string();
        let (program, args): (String, Vec<&str>) = match fs_type {
            "ext2" | "ext3" | "ext4" => (format!("mkfs.{fs_type}"), vec!["-F", "-m0", &device_str]),
            "xfs" => ("mkfs.xfs".to_owned(), vec!["-f", &device_str]),
            other => return Err(DiskError::UnsupportedFilesystem(other.to_owned())),
        };

        debug!(device = %device.display(), fs_type, "formatting device");
        let output = run_command(&program, &args, None).await?;
        if !output.status.success() {
            return Err(command_error(&program, &output));
        }
        Ok(())
    }

    /// Size of the block device in bytes, via `blockdev --getsize64`.
    async fn device_size(&self, device: &Path) -> Result<u64, DiskError> {
        let device_str = device.display().to_string();
        let output = run_command("blockdev", &["--getsize64", &device_str], None).await?;
        if !output.status.success() {
            return Err(command_error("blockdev", &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<u64>()
            .map_err(|err| DiskError::CommandFailed {
                command: "blockdev".to_owned(),
                message: format!("unparseable size {:?}: {err}", stdout.trim()),
            })
    }

    /// Size of the ext filesystem on the device, via `dumpe2fs -h`.
    async fn ext_fs_size(&self, device: &Path) -> Result<u64, DiskError> {
        let device_str = device.display().to_string();
        let output = run_command("dumpe2fs", &["-h", &device_str], None).await?;
        if !output.status.success() {
            return Err(command_error("dumpe2fs", &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ext_fs_size(&stdout).ok_or_else(|| DiskError::CommandFailed {
            command: "dumpe2fs".to_owned(),
            message: "block count or block size missing from output".to_owned(),
        })
    }
}

/// Extracts the filesystem size in bytes from a `dumpe2fs -h` output.
fn parse_ext_fs_size(output: &str) -> Option<u64> {
    let mut block_count: Option<u64> = None;
    let mut block_size: Option<u64> = None;

    for line in output.lines() {
        if let Some(value) = line.strip_prefix("Block count:") {
            block_count = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("Block size:") {
            block_size = value.trim().parse().ok();
        }
    }

    block_count?.checked_mul(block_size?)
}

#[async_trait]
impl DiskUtils for SysDiskUtils {
    async fn format_and_mount(
        &self,
        target_path: &Path,
        device_path: &Path,
        fs_type: &str,
        mount_options: &[String],
    ) -> Result<(), DiskError> {
        let fs_type = if fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            fs_type
        };

        debug!(
            device = %device_path.display(),
            target = %target_path.display(),
            fs_type,
            "attempting to mount device"
        );

        match self.disk_format(device_path).await? {
            None => self.format(device_path, fs_type).await?,
            Some(existing) if existing != fs_type => {
                return Err(DiskError::WrongFsType {
                    device: device_path.to_owned(),
                    found: existing,
                    wanted: fs_type.to_owned(),
                })
            }
            Some(_) => {}
        }

        self.mount(device_path, target_path, fs_type, mount_options)
            .await
    }

    async fn unmount(&self, target_path: &Path) -> Result<(), DiskError> {
        if self.is_mounted(target_path) {
            let target = target_path.to_owned();
            tokio::task::spawn_blocking(move || {
                if let Err(first) = mount::umount(target.as_path()) {
                    // Force as a fallback, some workloads keep the mount busy.
                    mount::umount2(target.as_path(), MntFlags::MNT_FORCE).map_err(|_| {
                        DiskError::UnmountFailed {
                            target: target.clone(),
                            errno: first,
                        }
                    })?;
                }
                Ok::<(), DiskError>(())
            })
            .await
            .map_err(|err| DiskError::CommandFailed {
                command: "umount".to_owned(),
                message: err.to_string(),
            })??;
        }

        // The CO expects the mount point to be gone after unpublish/unstage.
        match tokio::fs::metadata(target_path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(target_path).await?,
            Ok(_) => tokio::fs::remove_file(target_path).await?,
            Err(_) => {}
        }

        Ok(())
    }

    async fn mount_to_target(
        &self,
        source_path: &Path,
        target_path: &Path,
        fs_type: &str,
        mount_options: &[String],
    ) -> Result<(), DiskError> {
        self.mount(source_path, target_path, fs_type, mount_options)
            .await
    }

    fn is_block_device(&self, path: &Path) -> Result<bool, DiskError> {
        let real_path = std::fs::canonicalize(path)?;
        let file_stat = stat(&real_path).map_err(|errno| DiskError::Stat {
            path: real_path.clone(),
            errno,
        })?;

        let sflag = SFlag::from_bits_truncate(file_stat.st_mode & SFlag::S_IFMT.bits());
        Ok(sflag == SFlag::S_IFBLK)
    }

    fn get_device_path(&self, volume_id: &str) -> Result<PathBuf, DiskError> {
        let link_path = device_path(volume_id);
        let real_path = std::fs::canonicalize(&link_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                DiskError::DeviceNotFound(volume_id.to_owned())
            } else {
                DiskError::Io(err)
            }
        })?;

        let file_stat = stat(&real_path).map_err(|errno| DiskError::Stat {
            path: real_path.clone(),
            errno,
        })?;
        let sflag = SFlag::from_bits_truncate(file_stat.st_mode & SFlag::S_IFMT.bits());
        if sflag != SFlag::S_IFBLK {
            return Err(DiskError::NotBlockDevice(real_path));
        }

        Ok(link_path)
    }

    fn is_mounted(&self, target_path: &Path) -> bool {
        let Ok(target_stat) = stat(target_path) else {
            return false;
        };
        let Some(parent) = target_path.parent() else {
            return false;
        };
        let Ok(parent_stat) = stat(parent) else {
            return false;
        };

        // A mount point lives on a different device than its parent.
        target_stat.st_dev != parent_stat.st_dev
    }

    fn get_statfs(&self, path: &Path) -> Result<FsStats, DiskError> {
        let stats = statfs(path).map_err(|errno| DiskError::Statfs {
            path: path.to_owned(),
            errno,
        })?;

        Ok(FsStats {
            blocks: stats.blocks(),
            block_size: stats.block_size() as i64,
            blocks_free: stats.blocks_free(),
            files: stats.files(),
            files_free: stats.files_free(),
        })
    }

    async fn resize(
        &self,
        target_path: &Path,
        device_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), DiskError> {
        if let Some(passphrase) = passphrase {
            debug!(device = %device_path.display(), "resizing LUKS device");
            luks::luks_resize(device_path, passphrase).await?;
        }

        let fs_type = self.disk_format(device_path).await?.unwrap_or_default();
        match fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => {
                let device_size = self.device_size(device_path).await?;
                let fs_size = self.ext_fs_size(device_path).await?;
                if fs_size >= device_size {
                    return Ok(());
                }

                debug!(
                    device = %device_path.display(),
                    fs_size,
                    device_size,
                    "growing ext filesystem"
                );
                let device_str = device_path.display().to_string();
                let output = run_command("resize2fs", &[device_str.as_str()], None).await?;
                if !output.status.success() {
                    return Err(command_error("resize2fs", &output));
                }
                Ok(())
            }
            "xfs" => {
                // xfs_growfs is a no-op when the filesystem already fills
                // the device.
                let target_str = target_path.display().to_string();
                let output = run_command("xfs_growfs", &["-d", &target_str], None).await?;
                if !output.status.success() {
                    return Err(command_error("xfs_growfs", &output));
                }
                Ok(())
            }
            other => Err(DiskError::UnsupportedResize(other.to_owned())),
        }
    }

    async fn is_encrypted(&self, device_path: &Path) -> Result<bool, DiskError> {
        luks::luks_is_luks(device_path).await
    }

    async fn encrypt_and_open_device(
        &self,
        volume_id: &str,
        passphrase: &str,
    ) -> Result<PathBuf, DiskError> {
        if let Some(mapped) = self.get_mapped_device_path(volume_id).await? {
            // Device is already encrypted and open.
            return Ok(mapped);
        }

        let device = self.get_device_path(volume_id)?;

        if !luks::luks_is_luks(&device).await? {
            luks::luks_format(&device, passphrase).await?;
        }

        luks::luks_open(&device, &mapper_name(volume_id), passphrase).await?;

        Ok(mapper_path(volume_id))
    }

    async fn close_device(&self, volume_id: &str) -> Result<(), DiskError> {
        if self.get_mapped_device_path(volume_id).await?.is_some() {
            luks::luks_close(&mapper_name(volume_id)).await?;
        }
        Ok(())
    }

    async fn get_mapped_device_path(&self, volume_id: &str) -> Result<Option<PathBuf>, DiskError> {
        let mapped = mapper_path(volume_id);
        if tokio::fs::metadata(&mapped).await.is_err() {
            // The mapper device does not exist on disk, so it is not open.
            return Ok(None);
        }

        let status_output = luks::luks_status(&mapper_name(volume_id)).await?;
        if !luks::status_is_active(&status_output) {
            // cryptsetup exits non-zero for inactive devices, reaching here
            // with an inactive first line means something went wrong.
            return Err(DiskError::CommandFailed {
                command: "cryptsetup status".to_owned(),
                message: format!("device {} is not active", mapped.display()),
            });
        }

        Ok(Some(mapped))
    }
}

#[derive(Clone, Debug, Default)]
struct FakeMountpoint {
    target_path: Option<PathBuf>,
    fs_type: String,
    mount_options: Vec<String>,
    block: bool,
}

#[derive(Clone, Debug, Default)]
struct FakeLuksState {
    formatted: bool,
    open: bool,
}

#[derive(Default)]
struct FakeDiskState {
    devices: HashMap<PathBuf, FakeMountpoint>,
    luks: HashMap<String, FakeLuksState>,
}

/// In-memory disk utilities for the sanity suite. Devices appear and
/// disappear following the attachments of the backing fake server.
pub struct FakeDiskUtils {
    cloud: Arc<scaleway::Fake>,
    server_id: String,
    state: Mutex<FakeDiskState>,
}

impl FakeDiskUtils {
    /// Creates fake disk utilities tracking the volumes attached to
    /// `server_id` in the given fake cloud.
    pub fn new(cloud: Arc<scaleway::Fake>, server_id: &str) -> Self {
        Self {
            cloud,
            server_id: server_id.to_owned(),
            state: Mutex::new(FakeDiskState::default()),
        }
    }

    /// Syncs the device map with the fake server's attachments.
    fn refresh_devices(&self, state: &mut FakeDiskState) {
        let attached: Vec<PathBuf> = self
            .cloud
            .server(&self.server_id)
            .map(|server| {
                server
                    .volumes
                    .values()
                    .map(|volume| device_path(&volume.id))
                    .collect()
            })
            .unwrap_or_default();

        state
            .devices
            .retain(|path, _| !path.starts_with(DISK_BY_ID_PATH) || attached.contains(path));

        for path in attached {
            state.devices.entry(path).or_insert(FakeMountpoint {
                target_path: None,
                fs_type: String::new(),
                mount_options: Vec::new(),
                block: true,
            });
        }
    }

    /// Mount options recorded for the device mounted at `target`, for
    /// assertions in tests.
    pub fn mount_options_at(&self, target: &Path) -> Option<Vec<String>> {
        let state = self.state.lock();
        state
            .devices
            .values()
            .find(|mp| mp.target_path.as_deref() == Some(target))
            .map(|mp| mp.mount_options.clone())
    }

    /// Filesystem type recorded for the device mounted at `target`.
    pub fn fs_type_at(&self, target: &Path) -> Option<String> {
        let state = self.state.lock();
        state
            .devices
            .values()
            .find(|mp| mp.target_path.as_deref() == Some(target))
            .map(|mp| mp.fs_type.clone())
    }
}

#[async_trait]
impl DiskUtils for FakeDiskUtils {
    async fn format_and_mount(
        &self,
        target_path: &Path,
        device_path: &Path,
        fs_type: &str,
        mount_options: &[String],
    ) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        self.refresh_devices(&mut state);

        let fs_type = if fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            fs_type
        };

        state.devices.insert(
            device_path.to_owned(),
            FakeMountpoint {
                target_path: Some(target_path.to_owned()),
                fs_type: fs_type.to_owned(),
                mount_options: mount_options.to_vec(),
                block: false,
            },
        );

        Ok(())
    }

    async fn unmount(&self, target_path: &Path) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        for mountpoint in state.devices.values_mut() {
            if mountpoint.target_path.as_deref() == Some(target_path) {
                mountpoint.target_path = None;
            }
        }
        Ok(())
    }

    async fn mount_to_target(
        &self,
        source_path: &Path,
        target_path: &Path,
        fs_type: &str,
        mount_options: &[String],
    ) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        self.refresh_devices(&mut state);

        let fs_type = if fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            fs_type
        };

        let block =
            source_path.starts_with(DISK_BY_ID_PATH) || source_path.starts_with(LUKS_MAPPER_PATH);
        state.devices.insert(
            source_path.to_owned(),
            FakeMountpoint {
                target_path: Some(target_path.to_owned()),
                fs_type: fs_type.to_owned(),
                mount_options: mount_options.to_vec(),
                block,
            },
        );

        Ok(())
    }

    fn is_block_device(&self, path: &Path) -> Result<bool, DiskError> {
        let mut state = self.state.lock();
        self.refresh_devices(&mut state);

        state
            .devices
            .values()
            .find(|mp| mp.target_path.as_deref() == Some(path))
            .map(|mp| mp.block)
            .ok_or_else(|| {
                DiskError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no mount at {}", path.display()),
                ))
            })
    }

    fn get_device_path(&self, volume_id: &str) -> Result<PathBuf, DiskError> {
        let mut state = self.state.lock();
        self.refresh_devices(&mut state);

        let path = device_path(volume_id);
        if state.devices.contains_key(&path) {
            Ok(path)
        } else {
            Err(DiskError::DeviceNotFound(volume_id.to_owned()))
        }
    }

    fn is_mounted(&self, target_path: &Path) -> bool {
        let mut state = self.state.lock();
        self.refresh_devices(&mut state);

        state
            .devices
            .values()
            .any(|mp| mp.target_path.as_deref() == Some(target_path))
    }

    fn get_statfs(&self, _path: &Path) -> Result<FsStats, DiskError> {
        Ok(FsStats {
            blocks: 1000,
            block_size: 4096,
            blocks_free: 500,
            files: 1000,
            files_free: 500,
        })
    }

    async fn resize(
        &self,
        _target_path: &Path,
        _device_path: &Path,
        _passphrase: Option<&str>,
    ) -> Result<(), DiskError> {
        Ok(())
    }

    async fn is_encrypted(&self, device_path: &Path) -> Result<bool, DiskError> {
        let state = self.state.lock();
        let volume_id = device_path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(DISK_PREFIX))
            .unwrap_or_default();
        Ok(state.luks.get(volume_id).is_some_and(|luks| luks.formatted))
    }

    async fn encrypt_and_open_device(
        &self,
        volume_id: &str,
        _passphrase: &str,
    ) -> Result<PathBuf, DiskError> {
        self.get_device_path(volume_id)?;

        let mut state = self.state.lock();
        let luks = state.luks.entry(volume_id.to_owned()).or_default();
        luks.formatted = true;
        luks.open = true;

        let mapped = mapper_path(volume_id);
        state
            .devices
            .entry(mapped.clone())
            .or_insert(FakeMountpoint {
                target_path: None,
                fs_type: String::new(),
                mount_options: Vec::new(),
                block: true,
            });

        Ok(mapped)
    }

    async fn close_device(&self, volume_id: &str) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        if let Some(luks) = state.luks.get_mut(volume_id) {
            luks.open = false;
        }
        state.devices.remove(&mapper_path(volume_id));
        Ok(())
    }

    async fn get_mapped_device_path(&self, volume_id: &str) -> Result<Option<PathBuf>, DiskError> {
        let state = self.state.lock();
        Ok(state
            .luks
            .get(volume_id)
            .filter(|luks| luks.open)
            .map(|_| mapper_path(volume_id)))
    }
}
