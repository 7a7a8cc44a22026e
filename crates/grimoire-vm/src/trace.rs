//! Stack-trace rendering from bytecode debug info.

use grimoire_common::Bytecode;

use crate::coroutine::Frame;

fn frame_line(bc: &Bytecode, pc: usize) -> String {
    match bc.resolve_function(pc as u32) {
        Some(info) => format!("{} instr {}", info.name, pc),
        None => format!("Unknown Function instr {}", pc),
    }
}

/// Render one line per frame, innermost first: the faulting PC, then every
/// return site down the call stack. The root frame has no return site.
pub fn render(bc: &Bytecode, pc: usize, frames: &[Frame]) -> String {
    let mut lines = vec![frame_line(bc, pc)];
    for frame in frames.iter().skip(1).rev() {
        lines.push(frame_line(bc, frame.ret_pc));
    }
    lines.join("\n")
}
