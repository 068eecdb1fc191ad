// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Boot loader entries.
//!
//! The installed system boots through systemd-boot. Zprov owns one entry per
//! installed kernel, plus the loader configuration that picks the default
//! entry. All of them are plain [`ManagedFileStep`](super::ManagedFileStep)s
//! rendered from the templates below.

use glob::{glob, Pattern};
use std::path::Path;
use tracing::debug;

/// Microcode images that are loaded ahead of the initramfs when present.
const MICROCODE: &[&str] = &["intel-ucode.img", "amd-ucode.img"];

/// Kernels installed in target root, by package name, e.g., `linux-lts`.
///
/// Found through `/boot/vmlinuz-*`. Sorted for a stable entry order.
pub fn discover_kernels(root: &Path) -> Vec<String> {
    let boot = root.join("boot");
    let pattern = format!("{}/vmlinuz-*", Pattern::escape(&boot.to_string_lossy()));
    let Ok(paths) = glob(&pattern) else {
        return Vec::new();
    };

    let mut kernels = paths
        .filter_map(|path| path.ok())
        .filter_map(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("vmlinuz-"))
                .map(str::to_owned)
        })
        .collect::<Vec<_>>();
    kernels.sort();
    debug!("discovered kernels {kernels:?} under {:?}", boot.display());

    kernels
}

/// Microcode images installed in target root's `/boot`.
pub fn microcode_images(root: &Path) -> Vec<String> {
    MICROCODE
        .iter()
        .filter(|image| root.join("boot").join(image).is_file())
        .map(|image| image.to_string())
        .collect()
}

/// Name of boot entry file for kernel.
pub fn entry_file(kernel: &str) -> String {
    format!("{kernel}.conf")
}

/// Render systemd-boot entry for kernel.
pub fn entry_template(kernel: &str, microcode: &[String], options: &str) -> String {
    let mut entry = format!("title   Arch Linux ({kernel})\nlinux   /vmlinuz-{kernel}\n");
    for image in microcode {
        entry.push_str(&format!("initrd  /{image}\n"));
    }
    entry.push_str(&format!("initrd  /initramfs-{kernel}.img\noptions {options}\n"));

    entry
}

/// Render systemd-boot loader configuration.
pub fn loader_template(default_kernel: &str, timeout: u32) -> String {
    format!(
        "default {}\ntimeout {timeout}\nconsole-mode max\neditor  no\n",
        entry_file(default_kernel)
    )
}
