use clap::Parser as ClapParser;
use std::{process, sync::Arc};

use strophe::{
    Address, CallFlags, ExistentialDescriptor, IntrinsicType, LinkageSection, MemoryLoader,
    ModuleLocation, ObjectBuilder, ProcBuilder, ReturnOutcome, StatusCode, VM, VMCreateInfo,
    Value,
};

const PRELUDE: &str = "/prelude";
const MAIN: &str = "/demo/main";

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value = "info", help = "Log filter used when RUST_LOG is unset")]
    log_level: String,

    /// Values pushed before the result
    #[arg(long, default_value_t = 2, help = "Temporaries left on the data stack by the callee")]
    temporaries: usize,

    #[arg(long, default_value_t = 0, help = "Extra arguments passed to the callee")]
    rest: usize,

    #[arg(long, help = "Log every frame entry and exit")]
    trace_frames: bool,
}

fn demo_prelude() -> ObjectBuilder {
    let mut prelude = ObjectBuilder::new();
    for (name, intrinsic) in [
        ("Bool", IntrinsicType::Bool),
        ("Int", IntrinsicType::Int),
        ("Float", IntrinsicType::Float),
        ("Char", IntrinsicType::Char),
        ("Bytes", IntrinsicType::Bytes),
        ("Rest", IntrinsicType::Rest),
        ("String", IntrinsicType::String),
        ("Url", IntrinsicType::Url),
    ] {
        let ty = prelude.declare(LinkageSection::Type, format!("{name}Type").as_str());
        prelude.add_existential(ExistentialDescriptor {
            symbol: name.into(),
            intrinsic: Some(intrinsic),
            existential_type: Address::near(ty),
            super_existential: Address::INVALID,
            methods: Vec::new(),
            impls: Vec::new(),
        });
    }
    prelude
}

fn run(cli: &Cli) -> strophe::Result<()> {
    let mut main = ObjectBuilder::new();
    main.add_import(PRELUDE, true);
    main.add_proc_call("$entry", &ProcBuilder::new().locals(1).body(&[0; 4]), CallFlags::empty());
    let answer_proc = ProcBuilder::new().body(&[0; 4]);
    let answer = main.add_proc_call("answer", &answer_proc, CallFlags::empty());

    let loader = MemoryLoader::new()
        .with_module(PRELUDE, demo_prelude().build())
        .with_module(MAIN, main.build());
    let mut info = VMCreateInfo::new(Arc::new(loader));
    info.trace_frames = cli.trace_frames;
    let mut vm = VM::create(info, Some(ModuleLocation::new(MAIN)))?;

    // step over the calling instruction
    if let Some(fiber) = vm.current_fiber_mut() {
        fiber.advance_ip(4);
    }
    let arguments = (0..cli.rest).map(|i| Value::I64(i as i64)).collect();
    vm.call_static(Address::near(answer), arguments)?;

    if let Some(fiber) = vm.current_fiber_mut() {
        if let Some(frame) = fiber.current_call() {
            println!("entered {frame} with {} rest arguments", frame.num_rest());
        }
        fiber.extend_data_stack((0..cli.temporaries).map(|_| Value::Nil));
        fiber.push_data(Value::I64(42));
    }

    let outcome = vm.return_to_caller()?;
    if let Some(fiber) = vm.current_fiber() {
        let stack: Vec<String> = fiber.data_stack().iter().map(ToString::to_string).collect();
        println!("returned {outcome:?}, data stack [{}]", stack.join(", "));
    }

    if vm.return_to_caller()? == ReturnOutcome::Complete {
        println!("entry point finished");
    }
    vm.halt(StatusCode::Ok)?;
    println!("halted with status {}", vm.status_code());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
