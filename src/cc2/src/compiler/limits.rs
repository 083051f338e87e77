//! Capacity limits of the compile session.
//!
//! Every table and buffer is capacity-bounded; overflowing one is a counted
//! failure, never a reallocation. The numeric values are also part of the
//! compiled dialect (`CC2_*` spellings), so programs under compilation can
//! size their own tables to match.

pub const SRC_MAX: usize = 262144;
pub const PRE_MAX: usize = 393216;
pub const CODE_MAX: usize = 262144;
pub const DATA_MAX: usize = 196608;

/// Link base of the code segment; absolute addresses in emitted `mov imm32`
/// and the ELF program header derive from it.
pub const CODE_BASE: u32 = 0x0040_0000;
/// Link base of the data segment.
pub const DATA_BASE: u32 = 0x0044_0000;

pub const PP_MAX_DEFINES: usize = 256;
pub const PP_NAME_MAX: usize = 48;
pub const PP_BODY_MAX: usize = 192;
pub const PP_COND_MAX: usize = 8;
pub const PP_INCLUDE_DEPTH_MAX: usize = 1;
pub const PP_FILE_MAX: usize = 4096;
pub const PP_PARAM_MAX: usize = 8;
pub const PP_PARAM_NAME_MAX: usize = 24;

pub const MAX_LOCALS: usize = 2048;
pub const LOCAL_NAME_MAX: usize = 24;
pub const MAX_LOCAL_ARRAYS: usize = 192;
pub const MAX_PATCHES: usize = 32;
pub const MAX_FUNCS: usize = 320;
pub const FN_NAME_MAX: usize = 24;
pub const MAX_SCOPES: usize = 64;
pub const MAX_CALL_PATCHES: usize = 320;
pub const MAX_CALL_ARGS: usize = 16;
pub const ARG_CODE_MAX: usize = 160;
pub const ARG_STACK_DEPTH: usize = 2;
pub const MAX_STRUCTS: usize = 16;
pub const STRUCT_NAME_MAX: usize = 24;
pub const MAX_STRUCT_FIELDS: usize = 16;
pub const MAX_GLOBALS: usize = 256;
pub const GLOBAL_NAME_MAX: usize = 24;
pub const TOKEN_TEXT_MAX: usize = 255;

/// Hard iteration budget per phase; tripping it aborts a runaway parse.
pub const GUARD_MAX: u64 = 4_000_000;
/// The host yield hook runs once per this many guard ticks.
pub const YIELD_INTERVAL: u64 = 4096;

/// Capacity constants exposed to compiled programs by their dialect
/// spellings, for use wherever an integer literal is accepted.
pub fn dialect_const(name: &str) -> Option<i32> {
    let v = match name {
        "CC2_PP_MAX_DEFINES" => PP_MAX_DEFINES,
        "CC2_PP_MAX_NAME" => PP_NAME_MAX,
        "CC2_PP_MAX_BODY" => PP_BODY_MAX,
        "CC2_PP_MAX_COND" => PP_COND_MAX,
        "CC2_PP_MAX_INCLUDE_DEPTH" => PP_INCLUDE_DEPTH_MAX,
        "CC2_PP_FILE_BUF" => PP_FILE_MAX,
        "CC2_PP_MAX_PARAMS" => PP_PARAM_MAX,
        "CC2_PP_MAX_PARAM_NAME" => PP_PARAM_NAME_MAX,
        "CC2_PARSE_MAX_LOCALS" => MAX_LOCALS,
        "CC2_PARSE_LOCAL_NAME" => LOCAL_NAME_MAX,
        "CC2_PARSE_MAX_ARRAYS" => MAX_LOCAL_ARRAYS,
        "CC2_PARSE_MAX_PATCHES" => MAX_PATCHES,
        "CC2_PARSE_MAX_FUNCS" => MAX_FUNCS,
        "CC2_PARSE_FN_NAME" => FN_NAME_MAX,
        "CC2_PARSE_MAX_SCOPE" => MAX_SCOPES,
        "CC2_PARSE_MAX_CALL_PATCHES" => MAX_CALL_PATCHES,
        "CC2_PARSE_ARG_MAX" => MAX_CALL_ARGS,
        "CC2_PARSE_ARG_CODE_MAX" => ARG_CODE_MAX,
        "CC2_PARSE_ARG_CODE_STACK_DEPTH" => ARG_STACK_DEPTH,
        "CC2_PARSE_MAX_STRUCTS" => MAX_STRUCTS,
        "CC2_PARSE_STRUCT_NAME" => STRUCT_NAME_MAX,
        "CC2_PARSE_MAX_STRUCT_FIELDS" => MAX_STRUCT_FIELDS,
        "CC2_PARSE_MAX_GLOBALS" => MAX_GLOBALS,
        "CC2_PARSE_GLOBAL_NAME" => GLOBAL_NAME_MAX,
        "CC2_MAIN_SRC_MAX" => SRC_MAX,
        "CC2_MAIN_PRE_MAX" => PRE_MAX,
        "CC2_MAIN_CODE_MAX" => CODE_MAX,
        "CC2_MAIN_DATA_MAX" => DATA_MAX,
        "CC2_OUT_CODE_BASE" => return Some(CODE_BASE as i32),
        "CC2_OUT_DATA_BASE" => return Some(DATA_BASE as i32),
        "CC2_GUARD_MAX" => return Some(GUARD_MAX as i32),
        _ => return None,
    };
    Some(v as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_constants_match_limits() {
        assert_eq!(dialect_const("CC2_PARSE_MAX_LOCALS"), Some(2048));
        assert_eq!(dialect_const("CC2_MAIN_SRC_MAX"), Some(262144));
        assert_eq!(dialect_const("CC2_OUT_CODE_BASE"), Some(0x0040_0000));
        assert_eq!(dialect_const("CC2_NOT_A_LIMIT"), None);
    }
}
