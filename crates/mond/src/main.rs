//! Engine driver: load a binary chunk, run it to completion, report
//! the results.

use mond_bytecode::chunk;
use mond_vm::builtins::format_value;
use mond_vm::options::{TierPolicy, VmOptions};
use mond_vm::vm::Vm;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> ! {
    eprintln!("usage: mond [options] chunk.mbc");
    eprintln!("  -v            print version");
    eprintln!("  --interp      interpreter only (no tier-up)");
    eprintln!("  --baseline    generate baseline code up front");
    eprintln!("  --print-result  print the chunk's return values");
    std::process::exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut chunk_file: Option<String> = None;
    let mut tier_policy = TierPolicy::Default;
    let mut print_result = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" => {
                println!("mond {VERSION}");
                return;
            }
            "--interp" => tier_policy = TierPolicy::ForceInterpreter,
            "--baseline" => tier_policy = TierPolicy::ForceBaseline,
            "--print-result" => print_result = true,
            arg if arg.starts_with('-') => {
                eprintln!("mond: unrecognized option '{arg}'");
                usage();
            }
            arg => {
                if chunk_file.is_some() {
                    eprintln!("mond: multiple chunk files given");
                    usage();
                }
                chunk_file = Some(arg.to_string());
            }
        }
        i += 1;
    }

    let Some(path) = chunk_file else { usage() };
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("mond: cannot read '{path}': {e}");
            std::process::exit(1);
        }
    };
    let module = match chunk::load(&bytes) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("mond: '{path}': {e}");
            std::process::exit(1);
        }
    };

    let mut vm = Vm::create(VmOptions {
        tier_policy,
        ..VmOptions::default()
    });
    if tier_policy != TierPolicy::ForceInterpreter {
        mond_jit::attach(&mut vm);
    }

    match vm.launch_script(&module) {
        Ok(results) => {
            if print_result {
                for v in &results {
                    println!("{}", format_value(*v, &vm.heap, &vm.strings));
                }
            }
        }
        Err(e) => {
            eprintln!("mond: {e}");
            std::process::exit(1);
        }
    }
}
