// Executable payload detection. `install_binaries` and the relocation
// primitives need to tell real ELF/Mach-O binaries and scripts apart from
// readmes and license files sitting next to them in an archive.

use goblin::Object;
use std::fs;
use std::path::Path;

use crate::log_debug;

/// What kind of payload a file turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Elf,
    MachO,
    Script,
    Other,
}

/// Classifies a file by parsing its header bytes. Only the first few KB are
/// read; goblin parses lazily from the prefix for format detection.
pub fn classify_payload(path: &Path) -> PayloadKind {
    let Ok(bytes) = fs::read(path) else {
        return PayloadKind::Other;
    };
    classify_bytes(&bytes)
}

fn classify_bytes(bytes: &[u8]) -> PayloadKind {
    if bytes.starts_with(b"#!") {
        return PayloadKind::Script;
    }
    match Object::parse(bytes) {
        Ok(Object::Elf(_)) => PayloadKind::Elf,
        Ok(Object::Mach(_)) => PayloadKind::MachO,
        _ => PayloadKind::Other,
    }
}

/// Whether the file looks like something `install_binaries` should link
/// into `bin/`: a native executable or a script with a shebang.
pub fn is_executable_payload(path: &Path) -> bool {
    match classify_payload(path) {
        PayloadKind::Elf | PayloadKind::MachO | PayloadKind::Script => true,
        PayloadKind::Other => {
            log_debug!("[Binary] {} is not an executable payload", path.display());
            false
        }
    }
}

/// Whether the file is a native binary that relocation tools (patchelf,
/// install_name_tool) can operate on.
pub fn is_native_binary(path: &Path) -> bool {
    matches!(classify_payload(path), PayloadKind::Elf | PayloadKind::MachO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shebang_scripts_are_executable_payloads() {
        assert_eq!(classify_bytes(b"#!/bin/sh\necho hi\n"), PayloadKind::Script);
    }

    #[test]
    fn minimal_elf_header_classifies_as_elf() {
        // 64-bit little-endian ELF executable header, no sections.
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(b"\x7fELF");
        bytes[4] = 2; // 64-bit
        bytes[5] = 1; // little endian
        bytes[6] = 1; // version
        bytes[16] = 2; // ET_EXEC
        bytes[18] = 0x3e; // x86-64
        bytes[20] = 1; // EV_CURRENT
        assert_eq!(classify_bytes(&bytes), PayloadKind::Elf);
    }

    #[test]
    fn text_files_are_not_executable() {
        assert_eq!(classify_bytes(b"# README\njust text\n"), PayloadKind::Other);
        assert_eq!(classify_bytes(b""), PayloadKind::Other);
    }
}
