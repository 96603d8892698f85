use picomsg_comms::Hub;
use picomsg_transport::SOCKET_ENV;
use tracing::info;

use crate::cmd::selftest::{comms_config, finish, respond};
use crate::cmd::RespondArgs;
use crate::exit::{comms_error, CliError, CliResult, SUCCESS, USAGE};

pub fn run(args: RespondArgs) -> CliResult<i32> {
    let hub = Hub::global().map_err(|err| comms_error("hub start failed", err))?;
    let config = comms_config("Respond", args.noise, args.ring_bits);
    let comms = hub
        .inherit(&config)
        .map_err(|err| comms_error("inherit failed", err))?
        .ok_or_else(|| CliError::new(USAGE, format!("no inherited socket ({SOCKET_ENV} unset)")))?;

    let result = respond(&comms, args.timeout);
    finish(&comms);
    let echoed = result?;
    info!(echoed, "responder finished");
    Ok(SUCCESS)
}
