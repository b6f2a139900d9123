//! Wrappers around the `cryptsetup` tool for LUKS volume encryption.

use std::path::Path;

use super::diskutils::{command_error, run_command, DiskError};

const CRYPTSETUP_CMD: &str = "cryptsetup";
const LUKS_HASH: &str = "sha256";
const LUKS_CIPHER: &str = "aes-xts-plain64";
const LUKS_KEY_SIZE: &str = "256";

/// Formats the device as LUKS, reading the passphrase from stdin. Batch mode,
/// no interactive confirmation.
pub(super) async fn luks_format(device_path: &Path, passphrase: &str) -> Result<(), DiskError> {
    let device = device_path.display().to_string();
    let args = [
        "-q",
        "luksFormat",
        "--hash",
        LUKS_HASH,
        "--cipher",
        LUKS_CIPHER,
        "--key-size",
        LUKS_KEY_SIZE,
        &device,
        "--key-file",
        "/dev/stdin",
    ];

    let output = run_command(CRYPTSETUP_CMD, &args, Some(passphrase)).await?;
    if !output.status.success() {
        return Err(command_error("cryptsetup luksFormat", &output));
    }

    Ok(())
}

/// Opens the LUKS device under the given mapper name.
pub(super) async fn luks_open(
    device_path: &Path,
    mapper_name: &str,
    passphrase: &str,
) -> Result<(), DiskError> {
    let device = device_path.display().to_string();
    let args = ["luksOpen", &device, mapper_name, "--key-file", "/dev/stdin"];

    let output = run_command(CRYPTSETUP_CMD, &args, Some(passphrase)).await?;
    if !output.status.success() {
        return Err(command_error("cryptsetup luksOpen", &output));
    }

    Ok(())
}

/// Closes the mapper device.
pub(super) async fn luks_close(mapper_name: &str) -> Result<(), DiskError> {
    let output = run_command(CRYPTSETUP_CMD, &["luksClose", mapper_name], None).await?;
    if !output.status.success() {
        return Err(command_error("cryptsetup luksClose", &output));
    }

    Ok(())
}

/// Grows the mapper device to the size of the underlying device.
pub(super) async fn luks_resize(device_path: &Path, passphrase: &str) -> Result<(), DiskError> {
    let device = device_path.display().to_string();
    let args = ["resize", &device, "--key-file", "/dev/stdin"];

    let output = run_command(CRYPTSETUP_CMD, &args, Some(passphrase)).await?;
    if !output.status.success() {
        return Err(command_error("cryptsetup resize", &output));
    }

    Ok(())
}

/// Returns the `cryptsetup status` output for the mapper device.
pub(super) async fn luks_status(mapper_name: &str) -> Result<String, DiskError> {
    let output = run_command(CRYPTSETUP_CMD, &["status", mapper_name], None).await?;
    if !output.status.success() {
        return Err(command_error("cryptsetup status", &output));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Returns true if the device carries a LUKS header. `cryptsetup isLuks`
/// exits with code 1 for plain devices, which is not an error.
pub(super) async fn luks_is_luks(device_path: &Path) -> Result<bool, DiskError> {
    let device = device_path.display().to_string();
    let output = run_command(CRYPTSETUP_CMD, &["isLuks", &device], None).await?;

    if output.status.success() {
        return Ok(true);
    }
    if output.status.code() == Some(1) {
        return Ok(false);
    }

    Err(command_error("cryptsetup isLuks", &output))
}

/// Parses the first line of a `cryptsetup status` output. The device is open
/// when that line ends with `is active.` or `is active and is in use.`.
pub(super) fn status_is_active(status_output: &str) -> bool {
    let Some(first_line) = status_output.lines().next() else {
        return false;
    };
    first_line.ends_with("is active.") || first_line.ends_with("is active and is in use.")
}
