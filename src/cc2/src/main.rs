
use cc2::{default_out_path, fix_elf_suffix, is_valid_path, Compiler, OsHost};

/// Spellings of this binary that may appear as a stray first operand when
/// the shell passes its own command line through.
const SELF_NAMES: &[&str] = &[
    "cc2",
    "cc2.elf",
    "/bin/cc2.elf",
    "cc2_single",
    "cc2_single.elf",
    "/bin/cc2_single.elf",
    "cc3.elf",
    "/bin/cc3.elf",
];

#[derive(Debug, PartialEq, Eq)]
enum Request {
    Compile { input: String, output: String },
    Selftest,
    Nothing,
    BadArgs(String),
}

/// Tolerant argument scan: the first token ending in `.cc` is the input,
/// `-o` takes the following token, the binary's own name is skipped, and a
/// `selftest` token means "run no compile".
fn parse_request(tokens: &[String]) -> Request {
    let mut input: Option<String> = None;
    let mut output: Option<String> = None;
    let mut pending_out = false;
    for tok in tokens {
        if pending_out {
            output = Some(tok.clone());
            pending_out = false;
            continue;
        }
        match tok.as_str() {
            "selftest" | "--selftest" => return Request::Selftest,
            "-o" => pending_out = true,
            t if input.is_none() && SELF_NAMES.contains(&t) => {}
            t if input.is_none() && t.ends_with(".cc") => input = Some(t.to_string()),
            t => log::debug!("ignoring argument '{}'", t),
        }
    }
    if pending_out {
        return Request::BadArgs("expected output path after -o".to_string());
    }
    let Some(input) = input else {
        return Request::Nothing;
    };
    let output = fix_elf_suffix(&output.unwrap_or_else(|| default_out_path(&input)));
    if !is_valid_path(&input) || !is_valid_path(&output) {
        return Request::BadArgs("paths must be printable and under 128 bytes".to_string());
    }
    Request::Compile { input, output }
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()
        .ok();

    let tokens: Vec<String> = std::env::args().skip(1).collect();
    let ok = match parse_request(&tokens) {
        Request::Compile { input, output } => {
            log::info!("compile request in='{}' out='{}'", input, output);
            let host = OsHost;
            let mut compiler = Compiler::new(&host);
            match compiler.compile_file(&input, &output) {
                Ok(_) => true,
                Err(err) => {
                    log::error!("compile failed: {}", err);
                    false
                }
            }
        }
        Request::Selftest => {
            // The test suite is the selftest; the token only suppresses
            // compilation.
            log::info!("selftest requested; skipping compile");
            true
        }
        Request::Nothing => {
            log::info!("usage: cc2 <source.cc> [-o <out.elf>]");
            true
        }
        Request::BadArgs(reason) => {
            log::error!("argument parse failed: {}", reason);
            false
        }
    };

    if ok {
        log::info!("status PASS");
    } else {
        log::info!("status FAIL");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_compile_request() {
        assert_eq!(
            parse_request(&toks(&["prog.cc"])),
            Request::Compile {
                input: "prog.cc".to_string(),
                output: "prog.elf".to_string()
            }
        );
    }

    #[test]
    fn explicit_output_path() {
        assert_eq!(
            parse_request(&toks(&["prog.cc", "-o", "out.elf"])),
            Request::Compile {
                input: "prog.cc".to_string(),
                output: "out.elf".to_string()
            }
        );
    }

    #[test]
    fn own_name_is_tolerated() {
        assert_eq!(
            parse_request(&toks(&["/bin/cc2_single.elf", "prog.cc"])),
            Request::Compile {
                input: "prog.cc".to_string(),
                output: "prog.elf".to_string()
            }
        );
    }

    #[test]
    fn clipped_output_suffix_is_repaired() {
        assert_eq!(
            parse_request(&toks(&["prog.cc", "-o", "out.el"])),
            Request::Compile {
                input: "prog.cc".to_string(),
                output: "out.elf".to_string()
            }
        );
    }

    #[test]
    fn dangling_output_flag_is_an_error() {
        assert!(matches!(
            parse_request(&toks(&["prog.cc", "-o"])),
            Request::BadArgs(_)
        ));
    }

    #[test]
    fn selftest_skips_compilation() {
        assert_eq!(parse_request(&toks(&["--selftest", "prog.cc"])), Request::Selftest);
    }

    #[test]
    fn no_input_is_a_noop() {
        assert_eq!(parse_request(&toks(&[])), Request::Nothing);
        assert_eq!(parse_request(&toks(&["cc2_single.elf"])), Request::Nothing);
    }
}
