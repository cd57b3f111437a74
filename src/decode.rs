/// PTX decoder.
///
/// Decodes the subset of PTX the emulator understands into a `ProgramBuilder`.
/// The source is split into statements (terminated by `;`, labels, or scope
/// braces), then each statement inside the single `.entry` body is matched
/// against a small set of regular expressions. Opcodes the emulator does not
/// interpret decode as `Op::Other`, whose destination becomes undefined.
///
/// `.shared` variables are laid out in declaration order with their
/// alignment; `.extern .shared` arrays are placed after all fixed-size ones.
/// Their bindings are emitted at the start of the program.
use regex::{Captures, Regex};

use crate::error::{Result, VerifyError};
use crate::kernel::Dim3;
use crate::program::{
    AddrBase, Address, Axis, BarrierArgs, BinOp, CmpOp, Guard, Op, Operand, PredOp,
    ProgramBuilder, RegId, ShflMode, Space, Special, UnOp,
};

/// Result of decoding one PTX file.
#[derive(Debug)]
pub struct DecodedKernel {
    pub builder: ProgramBuilder,
    /// Block shape from `.maxntid` / `.reqntid`, if declared
    pub declared_block: Option<Dim3>,
}

pub fn decode(source: &str) -> Result<DecodedKernel> {
    Decoder::new()?.run(source)
}

// ---------------------------------------------------------------------------
// Statement splitting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Statement text without its terminator, and its first line
    Statement(String, usize),
    Open,
    Close,
}

/// Strip comments and cut the source into statements and scope braces.
fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut buffer = String::new();
    let mut start_line = 1;
    let mut in_block_comment = false;
    let mut in_vector = false;

    let flush = |buffer: &mut String, line: usize, tokens: &mut Vec<Token>| {
        let text = buffer.trim();
        if !text.is_empty() {
            tokens.push(Token::Statement(text.to_string(), line));
        }
        buffer.clear();
    };

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                }
                continue;
            }
            if c == '/' && chars.peek() == Some(&'/') {
                break;
            }
            if c == '/' && chars.peek() == Some(&'*') {
                chars.next();
                in_block_comment = true;
                continue;
            }
            if buffer.trim().is_empty() {
                start_line = line;
            }
            match c {
                ';' => flush(&mut buffer, start_line, &mut tokens),
                '{' if !opens_vector(&buffer) => {
                    flush(&mut buffer, start_line, &mut tokens);
                    tokens.push(Token::Open);
                }
                '{' => {
                    in_vector = true;
                    buffer.push(c);
                }
                '}' if in_vector => {
                    in_vector = false;
                    buffer.push(c);
                }
                '}' => {
                    flush(&mut buffer, start_line, &mut tokens);
                    tokens.push(Token::Close);
                }
                _ => buffer.push(c),
            }
        }
        if buffer.trim_end().ends_with(':') {
            flush(&mut buffer, start_line, &mut tokens);
        } else if !buffer.trim().is_empty() {
            buffer.push(' ');
        }
    }
    flush(&mut buffer, start_line, &mut tokens);
    tokens
}

/// A `{` inside an instruction starts a vector operand; anywhere else it
/// opens a scope.
fn opens_vector(buffer: &str) -> bool {
    let text = buffer.trim();
    !(text.is_empty() || text.starts_with('.') || text.ends_with(')') || text.ends_with(':'))
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// Module scope, before or after the kernel
    Outside,
    /// Between `.entry` and its opening brace
    Header,
    Body,
    Done,
}

struct SharedVar {
    name: String,
    size: i64,
    align: i64,
    external: bool,
    line: usize,
}

struct Patterns {
    entry: Regex,
    block_shape: Regex,
    shared: Regex,
    label: Regex,
    instruction: Regex,
    special: Regex,
    address: Regex,
}

impl Patterns {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| VerifyError::Internal(format!("bad decoder pattern: {e}")))
        };
        Ok(Patterns {
            entry: compile(r"\.entry\s+([\w$]+)")?,
            block_shape: compile(
                r"\.(?:maxntid|reqntid)\s+(\d+)(?:\s*,\s*(\d+))?(?:\s*,\s*(\d+))?",
            )?,
            shared: compile(
                r"^(\.extern\s+)?(?:\.visible\s+)?\.shared\s+(?:\.align\s+(\d+)\s+)?\.(\w+)\s+([\w$]+)((?:\s*\[\s*\d*\s*\])*)$",
            )?,
            label: compile(r"^([\w$.]+)\s*:\s*(.*)$")?,
            instruction: compile(
                r"^(?:@(!)?(%[\w$]+)\s+)?([a-z][a-z0-9_]*)((?:\.[\w]+)*)\s*(.*)$",
            )?,
            special: compile(r"^%(tid|ntid|ctaid|nctaid)\.([xyz])$")?,
            address: compile(r"^\[\s*([^\]+\-\s]+)?\s*(?:([+-])\s*([^\]\s]+))?\s*\]$")?,
        })
    }
}

struct Decoder {
    patterns: Patterns,
    builder: Option<ProgramBuilder>,
    body: Vec<(Op, Option<Guard>, usize)>,
    shared: Vec<SharedVar>,
    declared_block: Option<Dim3>,
    region: Region,
    depth: usize,
    /// Brace depth of scopes outside the kernel (e.g. `.func` bodies)
    outside_depth: usize,
}

impl Decoder {
    fn new() -> Result<Self> {
        Ok(Decoder {
            patterns: Patterns::new()?,
            builder: None,
            body: Vec::new(),
            shared: Vec::new(),
            declared_block: None,
            region: Region::Outside,
            depth: 0,
            outside_depth: 0,
        })
    }

    fn run(mut self, source: &str) -> Result<DecodedKernel> {
        for token in tokenize(source) {
            match token {
                Token::Open => self.open(),
                Token::Close => self.close(),
                Token::Statement(text, line) => self.statement(&text, line)?,
            }
        }
        let mut builder = self.builder.take().ok_or(VerifyError::NoKernel)?;
        if self.region == Region::Header {
            return Err(VerifyError::Parse {
                line: source.lines().count(),
                message: "kernel has no body".to_string(),
            });
        }

        for (name, address, line) in layout_shared(&self.shared) {
            builder.push(Op::SharedDecl { name, address }, None, line);
        }
        for (op, guard, line) in self.body {
            builder.push(op, guard, line);
        }
        Ok(DecodedKernel {
            builder,
            declared_block: self.declared_block,
        })
    }

    fn open(&mut self) {
        match self.region {
            Region::Header => {
                self.region = Region::Body;
                self.depth = 1;
            }
            Region::Body => self.depth += 1,
            Region::Outside | Region::Done => self.outside_depth += 1,
        }
    }

    fn close(&mut self) {
        match self.region {
            Region::Body => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth == 0 {
                    self.region = Region::Done;
                }
            }
            _ => self.outside_depth = self.outside_depth.saturating_sub(1),
        }
    }

    fn statement(&mut self, text: &str, line: usize) -> Result<()> {
        if let Some(caps) = self.patterns.entry.captures(text) {
            if self.builder.is_some() {
                return Err(VerifyError::MultipleKernels { line });
            }
            self.builder = Some(ProgramBuilder::new(&caps[1]));
            self.region = Region::Header;
            self.block_shape(text, line)?;
            return Ok(());
        }
        match self.region {
            Region::Header => self.block_shape(text, line),
            Region::Body => self.body_statement(text, line),
            Region::Outside | Region::Done => {
                if self.outside_depth == 0 && text.contains(".shared") {
                    self.shared_decl(text, line)?;
                }
                Ok(())
            }
        }
    }

    fn block_shape(&mut self, text: &str, line: usize) -> Result<()> {
        let Some(caps) = self.patterns.block_shape.captures(text) else {
            return Ok(());
        };
        let dim = |i: usize| -> Result<u32> {
            caps.get(i).map_or(Ok(1), |m| {
                m.as_str().parse().map_err(|_| VerifyError::Parse {
                    line,
                    message: format!("bad thread count '{}'", m.as_str()),
                })
            })
        };
        let shape = Dim3::new(dim(1)?, dim(2)?, dim(3)?);
        if shape.checked_size().is_none() {
            return Err(VerifyError::Parse {
                line,
                message: format!("declared block {shape} is empty or too large"),
            });
        }
        self.declared_block = Some(shape);
        Ok(())
    }

    fn shared_decl(&mut self, text: &str, line: usize) -> Result<()> {
        let Some(caps) = self.patterns.shared.captures(text.trim()) else {
            return Err(VerifyError::Parse {
                line,
                message: format!("unsupported .shared declaration '{text}'"),
            });
        };
        let element = type_width(&caps[3]);
        let mut count: i64 = 1;
        for dim in caps[5].split('[').skip(1) {
            let n = dim.trim_end_matches([']', ' ']).trim();
            if !n.is_empty() {
                let bad = || VerifyError::Parse {
                    line,
                    message: format!("bad array size '{n}'"),
                };
                let n = n.parse::<i64>().map_err(|_| bad())?;
                count = count.checked_mul(n).ok_or_else(bad)?;
            }
        }
        let align = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(element)
            .max(1);
        self.shared.push(SharedVar {
            name: caps[4].to_string(),
            size: element.checked_mul(count).ok_or_else(|| VerifyError::Parse {
                line,
                message: format!("shared array '{}' is too large", &caps[4]),
            })?,
            align,
            external: caps.get(1).is_some(),
            line,
        });
        Ok(())
    }

    fn body_statement(&mut self, text: &str, line: usize) -> Result<()> {
        let mut text = text.trim();
        if let Some(caps) = self.patterns.label.captures(text) {
            let name = caps[1].to_string();
            if !name.starts_with('.') {
                self.body.push((Op::Label(name), None, line));
                text = caps.get(2).map_or("", |m| m.as_str()).trim();
            }
        }
        if text.is_empty() {
            return Ok(());
        }
        if text.starts_with('.') || text.starts_with("//") {
            if text.contains(".shared") && !text.starts_with(".reg") {
                self.shared_decl(text, line)?;
            }
            return Ok(());
        }

        let Some(caps) = self.patterns.instruction.captures(text) else {
            return Err(VerifyError::Parse {
                line,
                message: format!("cannot decode '{text}'"),
            });
        };
        let guard = match caps.get(2) {
            Some(pred) => Some(Guard {
                pred: self.register(pred.as_str(), line)?,
                negated: caps.get(1).is_some(),
            }),
            None => None,
        };
        let op = self.instruction(&caps, line)?;
        self.body.push((op, guard, line));
        Ok(())
    }

    fn instruction(&mut self, caps: &Captures<'_>, line: usize) -> Result<Op> {
        let opcode = &caps[3];
        let mods: Vec<&str> = caps[4].split('.').filter(|m| !m.is_empty()).collect();
        let operands = split_operands(&caps[5]);
        let has = |m: &str| mods.contains(&m);
        let is_pred = has("pred");

        let op = match opcode {
            "mov" | "cvta" | "cvt" => {
                let [dst, src] = expect::<2>(&operands, opcode, line)?;
                if is_pred {
                    let dst = self.register(dst, line)?;
                    Op::PredLogic {
                        op: PredOp::And,
                        dst,
                        a: self.guard_operand(src, line)?,
                        b: Some(self.guard_operand(src, line)?),
                    }
                } else {
                    Op::Mov {
                        dst: self.register(dst, line)?,
                        src: self.operand(src, line)?,
                    }
                }
            }
            "and" | "or" | "xor" if is_pred => {
                let [dst, a, b] = expect::<3>(&operands, opcode, line)?;
                Op::PredLogic {
                    op: match opcode {
                        "and" => PredOp::And,
                        "or" => PredOp::Or,
                        _ => PredOp::Xor,
                    },
                    dst: self.register(dst, line)?,
                    a: self.guard_operand(a, line)?,
                    b: Some(self.guard_operand(b, line)?),
                }
            }
            "not" if is_pred => {
                let [dst, a] = expect::<2>(&operands, opcode, line)?;
                Op::PredLogic {
                    op: PredOp::Not,
                    dst: self.register(dst, line)?,
                    a: self.guard_operand(a, line)?,
                    b: None,
                }
            }
            "add" | "sub" | "mul" | "div" | "rem" | "and" | "or" | "xor" | "shl" | "shr"
            | "min" | "max" => {
                let op = match opcode {
                    "add" => BinOp::Add,
                    "sub" => BinOp::Sub,
                    "mul" if has("hi") => BinOp::MulHi,
                    "mul" => BinOp::MulLo,
                    "div" => BinOp::Div,
                    "rem" => BinOp::Rem,
                    "and" => BinOp::And,
                    "or" => BinOp::Or,
                    "xor" => BinOp::Xor,
                    "shl" => BinOp::Shl,
                    "shr" => BinOp::Shr,
                    "min" => BinOp::Min,
                    _ => BinOp::Max,
                };
                let [dst, a, b] = expect::<3>(&operands, opcode, line)?;
                Op::Binary {
                    op,
                    dst: self.register(dst, line)?,
                    a: self.operand(a, line)?,
                    b: self.operand(b, line)?,
                }
            }
            "mad" if !has("hi") => {
                let [dst, a, b, c] = expect::<4>(&operands, opcode, line)?;
                Op::Mad {
                    dst: self.register(dst, line)?,
                    a: self.operand(a, line)?,
                    b: self.operand(b, line)?,
                    c: self.operand(c, line)?,
                }
            }
            "not" | "neg" | "abs" => {
                let [dst, src] = expect::<2>(&operands, opcode, line)?;
                Op::Unary {
                    op: match opcode {
                        "not" => UnOp::Not,
                        "neg" => UnOp::Neg,
                        _ => UnOp::Abs,
                    },
                    dst: self.register(dst, line)?,
                    src: self.operand(src, line)?,
                }
            }
            "setp" if operands.len() == 3 => self.setp(&mods, &operands, line)?,
            "selp" => {
                let [dst, a, b, p] = expect::<4>(&operands, opcode, line)?;
                Op::Selp {
                    dst: self.register(dst, line)?,
                    a: self.operand(a, line)?,
                    b: self.operand(b, line)?,
                    pred: self.guard_operand(p, line)?,
                }
            }
            "ld" | "ldu" => {
                let [dst, addr] = expect::<2>(&operands, opcode, line)?;
                Op::Load {
                    space: space(&mods),
                    dsts: self.register_list(dst, line)?,
                    addr: self.address(addr, line)?,
                    width: mods_width(&mods),
                }
            }
            "st" => {
                let [addr, src] = expect::<2>(&operands, opcode, line)?;
                let srcs = vector_items(src)
                    .into_iter()
                    .map(|s| self.operand(s, line))
                    .collect::<Result<Vec<_>>>()?;
                Op::Store {
                    space: space(&mods),
                    addr: self.address(addr, line)?,
                    srcs,
                    width: mods_width(&mods),
                }
            }
            "atom" => {
                let dst = operands.first().copied().unwrap_or_default();
                let addr = operands.get(1).copied().unwrap_or_default();
                Op::Atomic {
                    space: space(&mods),
                    dst: Some(self.register(dst, line)?),
                    addr: self.address(addr, line)?,
                }
            }
            "red" => {
                let addr = operands.first().copied().unwrap_or_default();
                Op::Atomic {
                    space: space(&mods),
                    dst: None,
                    addr: self.address(addr, line)?,
                }
            }
            "bra" => {
                let [label] = expect::<1>(&operands, opcode, line)?;
                Op::Branch {
                    label: label.to_string(),
                    target: usize::MAX,
                }
            }
            "bar" | "barrier" if has("warp") => Op::Other {
                opcode: format!("{opcode}{}", &caps[4]),
                dst: None,
            },
            "bar" | "barrier" if has("arrive") => {
                let args = self.barrier_args(&operands, line)?;
                Op::BarrierArrive { args }
            }
            "bar" | "barrier" if has("red") => {
                // bar.red.op d, a{, b}, {!}c
                if operands.len() < 3 {
                    return Err(malformed(opcode, line));
                }
                let result = Some(self.register(operands[0], line)?);
                let args = self.barrier_args(&operands[1..operands.len() - 1], line)?;
                Op::BarrierSync { args, result }
            }
            "bar" | "barrier" => {
                let args = self.barrier_args(&operands, line)?;
                Op::BarrierSync { args, result: None }
            }
            "shfl" => self.shuffle(&mods, &operands, line)?,
            "ret" | "exit" => Op::Exit,
            _ => {
                let dst = match operands.first() {
                    Some(first) if first.starts_with('%') && self.special(first).is_none() => {
                        Some(self.register(first.split('|').next().unwrap_or(first), line)?)
                    }
                    _ => None,
                };
                Op::Other {
                    opcode: format!("{opcode}{}", &caps[4]),
                    dst,
                }
            }
        };
        Ok(op)
    }

    fn setp(&mut self, mods: &[&str], operands: &[&str], line: usize) -> Result<Op> {
        let cmp_mod = mods.first().copied().unwrap_or_default();
        let (cmp, unsigned_cmp) = match cmp_mod {
            "eq" => (CmpOp::Eq, false),
            "ne" => (CmpOp::Ne, false),
            "lt" => (CmpOp::Lt, false),
            "le" => (CmpOp::Le, false),
            "gt" => (CmpOp::Gt, false),
            "ge" => (CmpOp::Ge, false),
            "lo" => (CmpOp::Lt, true),
            "ls" => (CmpOp::Le, true),
            "hi" => (CmpOp::Gt, true),
            "hs" => (CmpOp::Ge, true),
            other => {
                return Err(VerifyError::Parse {
                    line,
                    message: format!("unsupported comparison '{other}'"),
                });
            }
        };
        let unsigned = unsigned_cmp
            || mods.iter().any(|m| {
                m.starts_with('u') || (m.starts_with('b') && m[1..].parse::<u32>().is_ok())
            });
        let mut dsts = operands[0].split('|').map(str::trim);
        let dst = self.register(dsts.next().unwrap_or_default(), line)?;
        let dst_neg = match dsts.next() {
            Some(q) => Some(self.register(q, line)?),
            None => None,
        };
        Ok(Op::SetP {
            cmp,
            unsigned,
            dst,
            dst_neg,
            a: self.operand(operands[1], line)?,
            b: self.operand(operands[2], line)?,
        })
    }

    fn shuffle(&mut self, mods: &[&str], operands: &[&str], line: usize) -> Result<Op> {
        let mode = if mods.contains(&"up") {
            ShflMode::Up
        } else if mods.contains(&"down") {
            ShflMode::Down
        } else if mods.contains(&"bfly") {
            ShflMode::Bfly
        } else if mods.contains(&"idx") {
            ShflMode::Idx
        } else {
            return Err(VerifyError::Parse {
                line,
                message: "shfl without a mode".to_string(),
            });
        };
        if operands.len() < 4 {
            return Err(malformed("shfl", line));
        }
        let mut dsts = operands[0].split('|').map(str::trim);
        let dst = self.register(dsts.next().unwrap_or_default(), line)?;
        let pred_dst = match dsts.next() {
            Some(p) => Some(self.register(p, line)?),
            None => None,
        };
        Ok(Op::Shuffle {
            mode,
            dst,
            pred_dst,
            src: self.operand(operands[1], line)?,
            lane: self.operand(operands[2], line)?,
            clamp: self.operand(operands[3], line)?,
        })
    }

    fn barrier_args(&mut self, operands: &[&str], line: usize) -> Result<BarrierArgs> {
        let name = match operands.first() {
            Some(a) => self.operand(a, line)?,
            None => Operand::Imm(0),
        };
        let count = match operands.get(1) {
            Some(b) => Some(self.operand(b, line)?),
            None => None,
        };
        Ok(BarrierArgs { name, count })
    }

    fn builder(&mut self, line: usize) -> Result<&mut ProgramBuilder> {
        self.builder.as_mut().ok_or(VerifyError::Parse {
            line,
            message: "instruction outside a kernel".to_string(),
        })
    }

    fn register(&mut self, name: &str, line: usize) -> Result<RegId> {
        let name = name.trim();
        if !name.starts_with('%') || name.len() < 2 {
            return Err(VerifyError::Parse {
                line,
                message: format!("expected a register, found '{name}'"),
            });
        }
        Ok(self.builder(line)?.register(name))
    }

    fn register_list(&mut self, text: &str, line: usize) -> Result<Vec<RegId>> {
        vector_items(text)
            .into_iter()
            .map(|r| self.register(r, line))
            .collect()
    }

    fn guard_operand(&mut self, text: &str, line: usize) -> Result<Guard> {
        let text = text.trim();
        let (negated, name) = match text.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        Ok(Guard {
            pred: self.register(name, line)?,
            negated,
        })
    }

    fn special(&self, text: &str) -> Option<Special> {
        let axis = |a: &str| match a {
            "x" => Axis::X,
            "y" => Axis::Y,
            _ => Axis::Z,
        };
        if let Some(caps) = self.patterns.special.captures(text) {
            let a = axis(&caps[2]);
            return Some(match &caps[1] {
                "tid" => Special::Tid(a),
                "ntid" => Special::Ntid(a),
                "ctaid" => Special::Ctaid(a),
                _ => Special::Nctaid(a),
            });
        }
        match text {
            "%laneid" => Some(Special::LaneId),
            "%warpid" => Some(Special::WarpId),
            "%nwarpid" => Some(Special::NWarpId),
            _ => None,
        }
    }

    fn operand(&mut self, text: &str, line: usize) -> Result<Operand> {
        let text = text.trim();
        if let Some(special) = self.special(text) {
            return Ok(Operand::Special(special));
        }
        if text.starts_with('%') {
            return Ok(Operand::Reg(self.register(text, line)?));
        }
        if let Some(value) = parse_immediate(text) {
            return Ok(Operand::Imm(value));
        }
        if text.is_empty() {
            return Err(VerifyError::Parse {
                line,
                message: "missing operand".to_string(),
            });
        }
        Ok(Operand::Symbol(text.to_string()))
    }

    fn address(&mut self, text: &str, line: usize) -> Result<Address> {
        let text = text.trim();
        let Some(caps) = self.patterns.address.captures(text) else {
            return Err(VerifyError::Parse {
                line,
                message: format!("bad address '{text}'"),
            });
        };
        let bad = || VerifyError::Parse {
            line,
            message: format!("bad address '{text}'"),
        };
        let mut offset = match caps.get(3) {
            Some(off) => parse_immediate(off.as_str()).ok_or_else(bad)?,
            None => 0,
        };
        if caps.get(2).map(|m| m.as_str()) == Some("-") {
            offset = -offset;
        }
        let base = match caps.get(1).map(|m| m.as_str()) {
            None => AddrBase::Absolute,
            Some(b) if b.starts_with('%') => AddrBase::Reg(self.register(b, line)?),
            Some(b) => match parse_immediate(b) {
                Some(v) => {
                    offset += v;
                    AddrBase::Absolute
                }
                None => AddrBase::Symbol(b.to_string()),
            },
        };
        Ok(Address { base, offset })
    }
}

fn expect<'a, const N: usize>(
    operands: &[&'a str],
    opcode: &str,
    line: usize,
) -> Result<[&'a str; N]> {
    <[&'a str; N]>::try_from(operands).map_err(|_| malformed(opcode, line))
}

fn malformed(opcode: &str, line: usize) -> VerifyError {
    VerifyError::Parse {
        line,
        message: format!("wrong number of operands for '{opcode}'"),
    }
}

/// Split operands on top-level commas (not inside `{}` or `[]`).
fn split_operands(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// Items of a `{a, b}` vector operand, or the operand itself
fn vector_items(text: &str) -> Vec<&str> {
    let text = text.trim();
    match text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        Some(inner) => inner.split(',').map(str::trim).filter(|s| !s.is_empty()).collect(),
        None => vec![text],
    }
}

fn space(mods: &[&str]) -> Space {
    for m in mods {
        match *m {
            "shared" => return Space::Shared,
            "global" => return Space::Global,
            "param" => return Space::Param,
            "local" => return Space::Local,
            _ => {}
        }
    }
    Space::Generic
}

/// Byte width of the element type among the modifiers
fn mods_width(mods: &[&str]) -> i64 {
    mods.iter()
        .rev()
        .find_map(|m| {
            let bits = m.get(1..)?.parse::<i64>().ok()?;
            matches!(m.as_bytes().first(), Some(b'b' | b'u' | b's' | b'f')).then_some(bits / 8)
        })
        .unwrap_or(4)
        .max(1)
}

fn type_width(ty: &str) -> i64 {
    mods_width(&[ty])
}

/// Decimal, hex (`0x..`, optional `U` suffix) and PTX float bit literals
/// (`0f........`, `0d................`).
pub fn parse_immediate(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let digits = digits.trim_end_matches(['U', 'u']);
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()? as i64
    } else if let Some(bits) = digits
        .strip_prefix("0f")
        .or_else(|| digits.strip_prefix("0F"))
        .or_else(|| digits.strip_prefix("0d"))
        .or_else(|| digits.strip_prefix("0D"))
    {
        u64::from_str_radix(bits, 16).ok()? as i64
    } else {
        if !digits.chars().all(|c| c.is_ascii_digit()) || digits.is_empty() {
            return None;
        }
        digits.parse::<i64>().ok()?
    };
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Assign addresses: fixed-size variables in order, each aligned, then the
/// extern arrays.
fn layout_shared(vars: &[SharedVar]) -> Vec<(String, i64, usize)> {
    let mut next = 0i64;
    let mut out = Vec::with_capacity(vars.len());
    let fixed = vars.iter().filter(|v| !v.external);
    let external = vars.iter().filter(|v| v.external);
    for var in fixed.chain(external) {
        let address = (next + var.align - 1) / var.align * var.align;
        out.push((var.name.clone(), address, var.line));
        next = address + var.size;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Kind;

    const REDUCE: &str = r#"
.version 7.0
.target sm_70
.address_size 64

// block-wide reduction
.visible .entry reduce(
    .param .u64 reduce_param_0
)
.maxntid 64, 1, 1
{
    .reg .pred %p<3>;
    .reg .b32 %r<10>;
    .reg .b64 %rd<4>;
    .shared .align 4 .b8 partial[256];

    mov.u32 %r1, %tid.x;
    shl.b32 %r2, %r1, 2;
    mov.u32 %r3, partial;
    add.s32 %r4, %r3, %r2;
    st.shared.u32 [%r4], %r1;
    bar.sync 0;
    setp.ne.s32 %p1, %r1, 0;
    @%p1 bra $L__BB0_2;
    ld.shared.v2.u32 {%r5, %r6}, [partial+8];
$L__BB0_2:
    ret;
}
"#;

    #[test]
    fn test_decode_reduce() {
        let decoded = decode(REDUCE).unwrap();
        assert_eq!(decoded.declared_block, Some(Dim3::new(64, 1, 1)));
        let program = decoded.builder.link(64).unwrap();
        assert_eq!(program.kernel_name(), "reduce");

        let counts = program.static_counts();
        assert_eq!(counts.get(Kind::SharedDecl), 1);
        assert_eq!(counts.get(Kind::StoreShared), 1);
        assert_eq!(counts.get(Kind::LoadShared), 1);
        assert_eq!(counts.get(Kind::BarrierSync), 1);
        assert_eq!(counts.get(Kind::Branch), 1);
        assert_eq!(counts.get(Kind::Label), 1);
        assert_eq!(counts.get(Kind::Exit), 1);

        let load = program
            .instructions()
            .iter()
            .find(|i| i.kind() == Kind::LoadShared)
            .unwrap();
        match &load.op {
            Op::Load { dsts, addr, width, .. } => {
                assert_eq!(dsts.len(), 2);
                assert_eq!(addr.base, AddrBase::Symbol("partial".into()));
                assert_eq!(addr.offset, 8);
                assert_eq!(*width, 4);
            }
            other => panic!("unexpected op {other:?}"),
        }
        let branch = program
            .instructions()
            .iter()
            .find(|i| i.kind() == Kind::Branch)
            .unwrap();
        assert!(branch.guard.is_some());
        assert_eq!(branch.line, 24);
    }

    #[test]
    fn test_no_and_multiple_kernels() {
        assert!(matches!(decode(".version 7.0\n"), Err(VerifyError::NoKernel)));
        let two = ".entry a()\n{\nret;\n}\n.entry b()\n{\nret;\n}\n";
        assert!(matches!(
            decode(two),
            Err(VerifyError::MultipleKernels { line: 5 })
        ));
    }

    #[test]
    fn test_barrier_forms() {
        let src = ".entry k()\n{\nbar.sync 1, 64;\nbar.arrive 2, 32;\nbarrier.sync.aligned 0;\nbar.red.popc.u32 %r1, 3, %p1;\nbar.warp.sync -1;\n}\n";
        let program = decode(src).unwrap().builder.link(128).unwrap();
        let ops: Vec<&Op> = program.instructions().iter().map(|i| &i.op).collect();
        assert_eq!(
            ops[0],
            &Op::BarrierSync {
                args: BarrierArgs {
                    name: Operand::Imm(1),
                    count: Some(Operand::Imm(64)),
                },
                result: None,
            }
        );
        assert!(matches!(ops[1], Op::BarrierArrive { .. }));
        match ops[2] {
            Op::BarrierSync { args, .. } => assert_eq!(args.count, Some(Operand::Imm(128))),
            other => panic!("unexpected op {other:?}"),
        }
        match ops[3] {
            Op::BarrierSync { args, result } => {
                assert_eq!(args.name, Operand::Imm(3));
                assert!(result.is_some());
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert!(matches!(ops[4], Op::Other { .. }));
    }

    #[test]
    fn test_shuffle_and_setp() {
        let src = ".entry k()\n.reqntid 32\n{\nshfl.sync.down.b32 %r2|%p2, %r1, 1, 0x1f, -1;\nsetp.lo.u32 %p1|%p3, %r1, 4;\n}\n";
        let decoded = decode(src).unwrap();
        assert_eq!(decoded.declared_block, Some(Dim3::x(32)));
        let program = decoded.builder.link(32).unwrap();
        assert!(program.has_shuffles());
        match &program.get(0).unwrap().op {
            Op::Shuffle {
                mode,
                pred_dst,
                clamp,
                ..
            } => {
                assert_eq!(*mode, ShflMode::Down);
                assert!(pred_dst.is_some());
                assert_eq!(*clamp, Operand::Imm(31));
            }
            other => panic!("unexpected op {other:?}"),
        }
        match &program.get(1).unwrap().op {
            Op::SetP {
                cmp,
                unsigned,
                dst_neg,
                ..
            } => {
                assert_eq!(*cmp, CmpOp::Lt);
                assert!(*unsigned);
                assert!(dst_neg.is_some());
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_shared_layout_extern_last() {
        let src = ".extern .shared .align 16 .b8 dyn[];\n.entry k()\n{\n.shared .align 4 .b8 a[6];\n.shared .align 8 .u64 b;\nret;\n}\n";
        let program = decode(src).unwrap().builder.link(1).unwrap();
        let decls: Vec<(String, i64)> = program
            .instructions()
            .iter()
            .filter_map(|i| match &i.op {
                Op::SharedDecl { name, address } => Some((name.clone(), *address)),
                _ => None,
            })
            .collect();
        assert_eq!(
            decls,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 8),
                ("dyn".to_string(), 16)
            ]
        );
    }

    #[test]
    fn test_unknown_opcode_clears_destination() {
        let src = ".entry k()\n{\nfma.rn.f32 %f1, %f2, %f3, %f4;\n}\n";
        let program = decode(src).unwrap().builder.link(1).unwrap();
        match &program.get(0).unwrap().op {
            Op::Other { opcode, dst } => {
                assert_eq!(opcode, "fma.rn.f32");
                assert!(dst.is_some());
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_parse_immediate() {
        assert_eq!(parse_immediate("42"), Some(42));
        assert_eq!(parse_immediate("-8"), Some(-8));
        assert_eq!(parse_immediate("0x1F"), Some(31));
        assert_eq!(parse_immediate("0xffffffffU"), Some(0xffff_ffff));
        assert_eq!(parse_immediate("0f3F800000"), Some(0x3F80_0000));
        assert_eq!(parse_immediate("partial"), None);
    }

    #[test]
    fn test_bad_address_is_parse_error() {
        let src = ".entry k()\n{\nld.shared.u32 %r1, %r2;\n}\n";
        assert!(matches!(decode(src), Err(VerifyError::Parse { line: 3, .. })));
    }

    #[test]
    fn test_oversized_block_is_parse_error() {
        // The header up to the brace is one statement starting on line 1
        let src = ".entry k()\n.maxntid 70000, 70000, 1\n{\nret;\n}\n";
        assert!(matches!(decode(src), Err(VerifyError::Parse { line: 1, .. })));
        let src = ".entry k()\n.reqntid 0\n{\nret;\n}\n";
        assert!(matches!(decode(src), Err(VerifyError::Parse { line: 1, .. })));
    }

    #[test]
    fn test_oversized_shared_array_is_parse_error() {
        let src = ".entry k()\n{\n.shared .b32 big[4294967296][4294967296];\nret;\n}\n";
        assert!(matches!(decode(src), Err(VerifyError::Parse { line: 3, .. })));
    }
}
