//! Builders that assemble encoded units; the authoring side of the codec.

use super::instr::Instruction;
use super::loader::{FORMAT_VERSION, MAGIC};

/// Assembles one unit and emits its binary encoding.
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    name: String,
    methods: Vec<MethodBuilder>,
}

impl UnitBuilder {
    /// Start a unit with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Append a method assembled inside `body`.
    pub fn method(
        mut self,
        name: impl Into<String>,
        arity: u8,
        locals: u8,
        body: impl FnOnce(&mut MethodBuilder),
    ) -> Self {
        let mut builder = MethodBuilder::new(name, arity, locals);
        body(&mut builder);
        self.methods.push(builder);
        self
    }

    /// Emit the binary unit.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.push(FORMAT_VERSION);
        push_name(&mut out, &self.name);
        out.extend_from_slice(&(self.methods.len() as u16).to_le_bytes());
        for method in &self.methods {
            method.encode_into(&mut out);
        }
        out
    }
}

/// Assembles one method record: instructions with their source lines.
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    name: String,
    arity: u8,
    locals: u8,
    code: Vec<Instruction>,
    lines: Vec<u32>,
}

impl MethodBuilder {
    fn new(name: impl Into<String>, arity: u8, locals: u8) -> Self {
        Self {
            name: name.into(),
            arity,
            locals,
            code: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Append one instruction attributed to `line` (0 = synthesized).
    pub fn instr(&mut self, instruction: Instruction, line: u32) -> &mut Self {
        self.code.push(instruction);
        self.lines.push(line);
        self
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        push_name(out, &self.name);
        out.push(self.arity);
        out.push(self.locals);

        // Compress per-instruction lines into range entries.
        let mut entries: Vec<(u16, u32)> = Vec::new();
        for (offset, line) in self.lines.iter().enumerate() {
            if entries.last().map(|(_, l)| l) != Some(line) {
                entries.push((offset as u16, *line));
            }
        }
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (start, line) in entries {
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&line.to_le_bytes());
        }

        let mut code_bytes = Vec::new();
        for instr in &self.code {
            instr.encode_into(&mut code_bytes);
        }
        out.extend_from_slice(&(code_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&code_bytes);
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}
