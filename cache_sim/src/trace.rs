use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{char, digit1, hex_digit1, space0, space1},
    combinator::{all_consuming, map, map_res, opt},
    sequence::{preceded, tuple},
    IResult,
};
use rand::Rng;
use thiserror::Error;

use crate::common::{mask_with_len, Addr};

pub const FULL_MASK: u32 = 0xFFFF_FFFF;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceOp {
    Read { addr: usize },
    Write { addr: usize, data: u32, mask: u32 },
}

impl TraceOp {
    pub fn addr(&self) -> usize {
        match *self {
            TraceOp::Read { addr } | TraceOp::Write { addr, .. } => addr,
        }
    }
}

impl fmt::Display for TraceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TraceOp::Read { addr } => write!(f, "r {addr:#x}"),
            TraceOp::Write { addr, data, mask } => {
                write!(f, "w {addr:#x} {data:#010x} {mask:#010x}")
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    #[error("line {line}: cannot parse `{content}`")]
    Malformed { line: usize, content: String },
}

fn hex_usize(input: &str) -> IResult<&str, usize> {
    preceded(
        tag_no_case("0x"),
        map_res(hex_digit1, |s: &str| usize::from_str_radix(s, 16)),
    )(input)
}

fn number(input: &str) -> IResult<&str, usize> {
    alt((hex_usize, map_res(digit1, |s: &str| s.parse::<usize>())))(input)
}

fn word(input: &str) -> IResult<&str, u32> {
    map_res(number, |n: usize| u32::try_from(n))(input)
}

fn read_op(input: &str) -> IResult<&str, TraceOp> {
    map(preceded(tuple((char('r'), space1)), number), |addr| {
        TraceOp::Read { addr }
    })(input)
}

fn write_op(input: &str) -> IResult<&str, TraceOp> {
    map(
        tuple((
            preceded(tuple((char('w'), space1)), number),
            preceded(space1, word),
            opt(preceded(space1, word)),
        )),
        |(addr, data, mask)| TraceOp::Write {
            addr,
            data,
            mask: mask.unwrap_or(FULL_MASK),
        },
    )(input)
}

fn line(input: &str) -> IResult<&str, TraceOp> {
    all_consuming(map(
        tuple((space0, alt((read_op, write_op)), space0)),
        |(_, op, _)| op,
    ))(input)
}

/// parses a whole trace. `#` starts a comment; blank lines are skipped.
pub fn parse_trace(src: &str) -> Result<Vec<TraceOp>, TraceError> {
    let mut ops = Vec::new();
    for (i, raw) in src.lines().enumerate() {
        let content = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        if content.trim().is_empty() {
            continue;
        }
        let (_, op) = line(content).map_err(|_| TraceError::Malformed {
            line: i + 1,
            content: raw.to_owned(),
        })?;
        ops.push(op);
    }
    log::info!("parsed {} trace operations", ops.len());
    Ok(ops)
}

/// `count` word-aligned accesses within `2^addr_width` bytes, about half of them writes.
/// widths beyond `usize` cover the whole address space.
pub fn random_trace(rng: &mut impl Rng, count: usize, addr_width: u32) -> Vec<TraceOp> {
    let last = mask_with_len(addr_width);
    (0..count)
        .map(|_| {
            let addr = rng.gen_range(0..=last) & !0x3;
            if rng.gen_bool(0.5) {
                TraceOp::Read { addr }
            } else {
                TraceOp::Write {
                    addr,
                    data: rng.gen(),
                    mask: byte_mask(rng.gen_range(0..16u8)),
                }
            }
        })
        .collect()
}

/// expands one bit per byte lane into a 32-bit mask.
fn byte_mask(lanes: u8) -> u32 {
    (0..4)
        .filter(|i| (lanes & (1 << i)) != 0)
        .fold(0, |acc, i| acc | (0xFF << (i * 8)))
}

/// shorthand used when reporting a trace operation.
pub fn describe(op: &TraceOp) -> String {
    match *op {
        TraceOp::Read { addr } => format!("read M[{}]", Addr::new(addr)),
        TraceOp::Write { addr, data, mask } => {
            format!("write M[{}] <- {data:#010x} (mask {mask:#010x})", Addr::new(addr))
        }
    }
}
