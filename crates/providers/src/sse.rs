//! SSE framing.
//!
//! Server-sent events arrive as chunks that do not respect event
//! boundaries. The buffer accumulates chunks; complete events (blocks
//! terminated by `\n\n`) are drained and reduced to their `data:`
//! payloads. A trailing partial event stays in the buffer for the next
//! chunk.

/// Drain complete `data:` payloads from an SSE buffer in place.
pub fn drain_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_owned());
                }
            }
        }
    }

    payloads
}

/// Flush whatever remains in the buffer as a final (unterminated)
/// event — used when the response body closes mid-event.
pub fn flush_remaining(buffer: &mut String) -> Vec<String> {
    if buffer.trim().is_empty() {
        buffer.clear();
        return Vec::new();
    }
    buffer.push_str("\n\n");
    drain_data_payloads(buffer)
}
