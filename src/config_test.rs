use std::fs::File;
use std::io::Write;

use tempdir::TempDir;

use crate::config::{Config, MmioConfig};
use crate::error::Error;

#[test]
fn can_parse_config() {
    let cfg = Config::from_toml(r#"
        [emulator]
        trace = true

        [machine]
        ram_size = 0x100000
        mmio = [
            { base = 0xFEE00000, size = 0x1000 },
            { base = 0xFEC00000, size = 0x1000 },
        ]
    "#).unwrap();

    assert_eq!(true, cfg.emulator.trace);
    assert_eq!(true, cfg.emulator.report_unimplemented);
    assert_eq!(0x10_0000, cfg.machine.ram_size);
    assert_eq!(MmioConfig { base: 0xFEE0_0000, size: 0x1000 }, cfg.machine.mmio[0]);
}

#[test]
fn empty_config_uses_defaults() {
    let cfg = Config::from_toml("").unwrap();
    assert_eq!(Config::default(), cfg);
}

#[test]
fn rejects_invalid_layouts() {
    let unaligned = "[machine]\nram_size = 0x1234";
    match Config::from_toml(unaligned) {
        Err(Error::InvalidConfig(_)) => {}
        other => panic!("expected InvalidConfig, got {:?}", other),
    }

    let in_ram = "[machine]\nram_size = 0x100000\nmmio = [{ base = 0x1000, size = 0x1000 }]";
    assert!(Config::from_toml(in_ram).is_err());

    let overlapping = r#"
        [machine]
        mmio = [
            { base = 0xFEE00000, size = 0x2000 },
            { base = 0xFEE01000, size = 0x1000 },
        ]
    "#;
    assert!(Config::from_toml(overlapping).is_err());

    match Config::from_toml("[machine]\nram_size = \"big\"") {
        Err(Error::Toml(_)) => {}
        other => panic!("expected Toml, got {:?}", other),
    }
}

#[test]
fn can_load_config_file() {
    let dir = TempDir::new("trapemu").unwrap();
    let path = dir.path().join("vm.toml");
    let mut f = File::create(&path).unwrap();
    f.write_all(b"[emulator]\nreport_unimplemented = false\n").unwrap();

    let cfg = Config::load(&path).unwrap();
    assert_eq!(false, cfg.emulator.report_unimplemented);

    match Config::load(dir.path().join("missing.toml")) {
        Err(Error::Io(_)) => {}
        other => panic!("expected Io, got {:?}", other),
    }
}
