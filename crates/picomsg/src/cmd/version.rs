use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("picomsg {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: picomsg");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("PICOMSG_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("socket_env: {}", picomsg_transport::SOCKET_ENV);
    println!(
        "ring_size_bits: default={}, min={}, max={}",
        picomsg_frame::DEFAULT_SIZE_BITS,
        picomsg_frame::MIN_SIZE_BITS,
        picomsg_frame::MAX_SIZE_BITS
    );

    Ok(SUCCESS)
}
