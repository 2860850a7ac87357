//! Integration tests for components built from configuration files

use anyhow::Result;
use hwcodec::{CodecError, Config, ProcessType};
use hwcodec_integration_tests::{numbered_stream, test_config, TestFixture};
use tempfile::TempDir;

#[test]
fn test_component_from_saved_config() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("hwcodec.toml");

    let mut config = test_config(ProcessType::Copy);
    config.input_port.codec_buffer_size = 1024;
    config.save_to(&path)?;

    let loaded = Config::from_file(&path)?;
    assert_eq!(loaded.input_port.process_type, ProcessType::Copy);
    assert_eq!(loaded.input_port.codec_buffer_size, 1024);

    let mut fixture = TestFixture::loopback_with_config(loaded, 0)?;
    fixture.to_executing()?;
    fixture.submit_outputs()?;
    let delivered = fixture.run_stream(&numbered_stream(&[0, 33_000, 66_000]))?;
    assert_eq!(delivered.len(), 3);
    fixture.to_loaded()?;
    Ok(())
}

#[test]
fn test_invalid_file_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[pipeline]\nmax_wait_ms = \"soon\"\n")?;

    let err = Config::from_file(&path).unwrap_err();
    assert!(matches!(err, CodecError::Config(_)), "{:?}", err);
    Ok(())
}
