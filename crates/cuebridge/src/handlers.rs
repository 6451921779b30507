//! The inbound address table.
//!
//! Every address takes the sender id as argument 0. A message without one is
//! rejected before its handler runs; otherwise the id is ignored unless the
//! engine needs it.

use crate::bridge::protocol::{OutboundEvent, VersionReport};
use crate::dispatch::{Args, Dispatcher, HandlerContext, HandlerError};
use crate::engine::{BeautifyRequest, IndentRequest, MixerCommand, RecordingCommand};

/// Inbound addresses sent by the GUI.
pub mod address {
    pub const RUN_CODE: &str = "/run-code";
    pub const SAVE_AND_RUN_BUFFER: &str = "/save-and-run-buffer";
    pub const SAVE_BUFFER: &str = "/save-buffer";
    pub const EXIT: &str = "/exit";
    pub const STOP_ALL_JOBS: &str = "/stop-all-jobs";
    pub const LOAD_BUFFER: &str = "/load-buffer";
    pub const COMPLETE_SNIPPET_OR_INDENT_SELECTION: &str = "/complete-snippet-or-indent-selection";
    pub const BEAUTIFY_BUFFER: &str = "/beautify-buffer";
    pub const PING: &str = "/ping";
    pub const START_RECORDING: &str = "/start-recording";
    pub const STOP_RECORDING: &str = "/stop-recording";
    pub const DELETE_RECORDING: &str = "/delete-recording";
    pub const SAVE_RECORDING: &str = "/save-recording";
    pub const MIXER_INVERT_STEREO: &str = "/mixer-invert-stereo";
    pub const MIXER_STANDARD_STEREO: &str = "/mixer-standard-stereo";
    pub const MIXER_STEREO_MODE: &str = "/mixer-stereo-mode";
    pub const MIXER_MONO_MODE: &str = "/mixer-mono-mode";
    pub const MIXER_HPF_ENABLE: &str = "/mixer-hpf-enable";
    pub const MIXER_HPF_DISABLE: &str = "/mixer-hpf-disable";
    pub const MIXER_LPF_ENABLE: &str = "/mixer-lpf-enable";
    pub const MIXER_LPF_DISABLE: &str = "/mixer-lpf-disable";
    pub const ENABLE_UPDATE_CHECKING: &str = "/enable-update-checking";
    pub const DISABLE_UPDATE_CHECKING: &str = "/disable-update-checking";
    pub const CHECK_FOR_UPDATES_NOW: &str = "/check-for-updates-now";
    pub const VERSION: &str = "/version";
    pub const GUI_HEARTBEAT: &str = "/gui-heartbeat";
    pub const RELOAD: &str = "/reload";
}

type HandlerResult = Result<(), HandlerError>;

/// Register the full GUI address table.
pub fn register_all(dispatcher: &mut Dispatcher) {
    route(dispatcher, address::RUN_CODE, run_code);
    route(dispatcher, address::SAVE_AND_RUN_BUFFER, save_and_run_buffer);
    route(dispatcher, address::SAVE_BUFFER, save_buffer);
    route(dispatcher, address::EXIT, |ctx, _| Ok(ctx.engine.exit()?));
    route(dispatcher, address::STOP_ALL_JOBS, |ctx, _| Ok(ctx.engine.stop_jobs()?));
    route(dispatcher, address::LOAD_BUFFER, load_buffer);
    route(
        dispatcher,
        address::COMPLETE_SNIPPET_OR_INDENT_SELECTION,
        complete_snippet_or_indent_selection,
    );
    route(dispatcher, address::BEAUTIFY_BUFFER, beautify_buffer);
    route(dispatcher, address::PING, ping);

    route(dispatcher, address::START_RECORDING, |ctx, _| {
        Ok(ctx.engine.recording(RecordingCommand::Start)?)
    });
    route(dispatcher, address::STOP_RECORDING, |ctx, _| {
        Ok(ctx.engine.recording(RecordingCommand::Stop)?)
    });
    route(dispatcher, address::DELETE_RECORDING, |ctx, _| {
        Ok(ctx.engine.recording(RecordingCommand::Delete)?)
    });
    route(dispatcher, address::SAVE_RECORDING, save_recording);

    for (addr, command) in [
        (address::MIXER_INVERT_STEREO, MixerCommand::InvertStereo),
        (address::MIXER_STANDARD_STEREO, MixerCommand::StandardStereo),
        (address::MIXER_STEREO_MODE, MixerCommand::StereoMode),
        (address::MIXER_MONO_MODE, MixerCommand::MonoMode),
        (address::MIXER_HPF_DISABLE, MixerCommand::DisableHpf),
        (address::MIXER_LPF_DISABLE, MixerCommand::DisableLpf),
    ] {
        route(dispatcher, addr, move |ctx, _| Ok(ctx.engine.mixer(command)?));
    }
    route(dispatcher, address::MIXER_HPF_ENABLE, |ctx, args| {
        Ok(ctx.engine.mixer(MixerCommand::EnableHpf(args.float(1)?))?)
    });
    route(dispatcher, address::MIXER_LPF_ENABLE, |ctx, args| {
        Ok(ctx.engine.mixer(MixerCommand::EnableLpf(args.float(1)?))?)
    });

    route(dispatcher, address::ENABLE_UPDATE_CHECKING, |ctx, _| {
        Ok(ctx.engine.set_update_checking(true)?)
    });
    route(dispatcher, address::DISABLE_UPDATE_CHECKING, |ctx, _| {
        Ok(ctx.engine.set_update_checking(false)?)
    });
    route(dispatcher, address::CHECK_FOR_UPDATES_NOW, |ctx, _| {
        Ok(ctx.engine.check_for_updates_now()?)
    });
    route(dispatcher, address::VERSION, version);
    route(dispatcher, address::GUI_HEARTBEAT, |ctx, args| {
        Ok(ctx.engine.gui_heartbeat(&args.text(0)?)?)
    });
    route(dispatcher, address::RELOAD, |ctx, _| Ok(ctx.engine.reload()?));
}

/// Register `handler` behind the sender id check.
fn route<F>(dispatcher: &mut Dispatcher, address: &str, handler: F)
where
    F: Fn(&HandlerContext, &Args<'_>) -> HandlerResult + Send + Sync + 'static,
{
    dispatcher.register(address, move |ctx, args| {
        args.text(0)?;
        handler(ctx, args)
    });
}

fn run_code(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    ctx.engine.eval(&args.text(1)?, None)?;
    Ok(())
}

fn save_and_run_buffer(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    let buffer_id = args.text(1)?;
    let code = args.text(2)?;
    let workspace = args.text(3)?;
    ctx.engine.save_buffer(&buffer_id, &code)?;
    ctx.engine.eval(&code, Some(&workspace))?;
    Ok(())
}

fn save_buffer(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    ctx.engine.save_buffer(&args.text(1)?, &args.text(2)?)?;
    Ok(())
}

fn load_buffer(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    ctx.engine.load_buffer(&args.text(1)?)?;
    Ok(())
}

fn complete_snippet_or_indent_selection(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    let request = IndentRequest {
        id: args.text(1)?,
        buffer: args.text(2)?,
        start_line: args.int(3)?,
        finish_line: args.int(4)?,
        point_line: args.int(5)?,
        point_index: args.int(6)?,
    };
    ctx.engine.complete_snippet_or_indent_lines(request)?;
    Ok(())
}

fn beautify_buffer(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    let request = BeautifyRequest {
        id: args.text(1)?,
        buffer: args.text(2)?,
        line: args.int(3)?,
        index: args.int(4)?,
        first_line: args.int(5)?,
    };
    ctx.engine.beautify_buffer(request)?;
    Ok(())
}

/// Liveness check: echo the request id straight back.
fn ping(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    ctx.events.send(OutboundEvent::Ack { id: args.raw(1)? })?;
    Ok(())
}

fn save_recording(ctx: &HandlerContext, args: &Args<'_>) -> HandlerResult {
    let filename = args.text(1)?;
    ctx.engine.recording(RecordingCommand::Save { filename })?;
    Ok(())
}

fn version(ctx: &HandlerContext, _args: &Args<'_>) -> HandlerResult {
    let current = ctx.engine.current_version()?;
    let latest = ctx.engine.latest_version()?;
    let last_checked = ctx.engine.last_update_check()?;
    ctx.events.send(OutboundEvent::VersionInfo(VersionReport {
        version: current.label,
        version_num: current.number,
        latest: latest.label,
        latest_num: latest.number,
        last_checked,
    }))?;
    Ok(())
}
