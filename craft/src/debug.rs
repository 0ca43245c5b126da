//! Bytecode disassembler.
//!
//! Purely a debugging aid — nothing here runs during normal interpretation.
//! Used by the `craft-cli --disassembly` flag and by tests that pin down
//! exact bytecode shape for a handful of constructs.

use crate::chunk::OpCode;
use crate::object::{Function, ObjRef};
use crate::value::Value;

/// Disassembles `function` and every nested function reachable through its
/// constant pool (closures capture their inner function as a constant), in
/// the order the compiler emitted them.
pub fn disassemble(function_ref: ObjRef, show_lines: bool) -> Vec<String> {
    let mut out = Vec::new();
    disassemble_into(function_ref, show_lines, &mut out);
    out
}

fn disassemble_into(function_ref: ObjRef, show_lines: bool, out: &mut Vec<String>) {
    let function = function_ref.get().as_function().unwrap();
    let name = function.name.clone().unwrap_or_else(|| "script".to_string());
    out.push(format!("== {} ==", name));

    let mut offset = 0;
    while offset < function.chunk.code.len() {
        offset = disassemble_instruction(function, offset, show_lines, out);
    }

    for value in &function.chunk.constants {
        if let Value::Obj(r) = value {
            if r.get().as_function().is_some() {
                out.push(String::new());
                disassemble_into(*r, show_lines, out);
            }
        }
    }
}

/// Exposed to the VM's `trace_interpreter` hook so it can print the
/// instruction about to execute, the same instruction format `-d` dumps.
pub(crate) fn disassemble_instruction(function: &Function, offset: usize, show_lines: bool, out: &mut Vec<String>) -> usize {
    let chunk = &function.chunk;
    let prefix = if show_lines {
        let line = chunk.line_at(offset);
        if offset > 0 && line == chunk.line_at(offset - 1) {
            format!("{:04}    | ", offset)
        } else {
            format!("{:04} {:4} ", offset, line)
        }
    } else {
        format!("{:04} ", offset)
    };

    let op = OpCode::from_byte(chunk.code[offset]);
    match op {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Exponent
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::Inherit => {
            out.push(format!("{}{:?}", prefix, op));
            offset + 1
        }
        OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal | OpCode::Class | OpCode::GetProperty | OpCode::SetProperty | OpCode::Method | OpCode::GetSuper => {
            let index = chunk.code[offset + 1] as usize;
            out.push(format!("{}{:<16} {:4} '{}'", prefix, format!("{:?}", op), index, chunk.constants[index]));
            offset + 2
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue | OpCode::Call => {
            let slot = chunk.code[offset + 1];
            out.push(format!("{}{:<16} {:4}", prefix, format!("{:?}", op), slot));
            offset + 2
        }
        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
            let target = offset + 3 + jump;
            out.push(format!("{}{:<16} {:4} -> {}", prefix, format!("{:?}", op), offset, target));
            offset + 3
        }
        OpCode::Loop => {
            let jump = ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
            let target = offset + 3 - jump;
            out.push(format!("{}{:<16} {:4} -> {}", prefix, format!("{:?}", op), offset, target));
            offset + 3
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.code[offset + 1] as usize;
            let argc = chunk.code[offset + 2];
            out.push(format!("{}{:<16} ({} args) {:4} '{}'", prefix, format!("{:?}", op), argc, index, chunk.constants[index]));
            offset + 3
        }
        OpCode::Closure => {
            let mut cursor = offset + 1;
            let index = chunk.code[cursor] as usize;
            cursor += 1;
            out.push(format!("{}{:<16} {:4} '{}'", prefix, format!("{:?}", op), index, chunk.constants[index]));
            let upvalue_count = match &chunk.constants[index] {
                Value::Obj(r) => r.get().as_function().map(|f| f.upvalue_count).unwrap_or(0),
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[cursor] != 0;
                let slot = chunk.code[cursor + 1];
                out.push(format!("{:04}    |                     {} {}", cursor, if is_local { "local" } else { "upvalue" }, slot));
                cursor += 2;
            }
            cursor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_disassemble_simple_script() {
        let mut heap = Heap::new();
        let function_ref = crate::compiler::compile("print 1 + 2;", &mut heap).unwrap();
        let lines = disassemble(function_ref, true);
        assert!(lines[0].starts_with("== script =="));
        assert!(lines.iter().any(|l| l.contains("Constant")));
        assert!(lines.iter().any(|l| l.contains("Add")));
        assert!(lines.iter().any(|l| l.contains("Print")));
    }

    #[test]
    fn test_disassemble_recurses_into_nested_function() {
        let mut heap = Heap::new();
        let function_ref = crate::compiler::compile("fun f(a) { return a; }", &mut heap).unwrap();
        let lines = disassemble(function_ref, false);
        assert!(lines.iter().any(|l| l.contains("== f ==")));
    }
}
