use anyhow::Result;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value)?;
    println!("{output}");
    Ok(())
}

/// One compact JSON document per line, for streamed events.
pub fn print_json_line<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string(value)?;
    println!("{output}");
    Ok(())
}
