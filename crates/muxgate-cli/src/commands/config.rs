use muxgate_load::LoadConfig;

pub fn print() -> anyhow::Result<()> {
    print!("{}", LoadConfig::default().to_toml_string()?);
    Ok(())
}
