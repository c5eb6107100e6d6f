/// formats bytes as a contiguous hex string, used in diagnostics for undecodable or unimplemented instructions
pub fn hex_bytes(data: &[u8]) -> String {
    let strs: Vec<String> = data.iter().map(|b| format!("{:02X}", b)).collect();
    strs.join("")
}
