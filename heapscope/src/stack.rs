//! Call stack rendering
//!
//! Renders managed frames one per line, innermost first:
//!
//! ```text
//! #0  0x00007ff9a0001234 System.Threading.Monitor.Enter
//! #1  0x00007ff9a0005678 App.Worker.Run
//! ```
//!
//! The blocking heuristics scan this text, so it is the one place the frame
//! format is defined.

use heapscope_common::FrameInfo;

/// Format one frame
#[must_use]
pub fn format_frame(index: usize, frame: &FrameInfo) -> String {
    format!("#{index:<2} 0x{:016x} {}", frame.instruction_pointer, frame.display_name())
}

/// Render `frames` as text, one line per frame
#[must_use]
pub fn render_stack(frames: &[FrameInfo]) -> String {
    frames
        .iter()
        .enumerate()
        .map(|(i, frame)| format_frame(i, frame))
        .collect::<Vec<_>>()
        .join("\n")
}
