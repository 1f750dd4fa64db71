use std::collections::HashMap;
use std::sync::Arc;
use std::{env, process};

use engine::catalog::{Catalog, DST_CMOS, DST_CMOS16};
use engine::error::InstallError;
use engine::hooks::{
    HookHandle, HookInstaller, RegisterWriteInterceptor, WritePath, WritePathAddresses,
};
use engine::intercept::{
    CallerContext, ShadowPayload, TERMINATOR_16, TERMINATOR_32, WritePayload,
};
use engine::key::{GroupingMode, RegisterKey};
use engine::policy::OverrideMode;
use engine::{Engine, Settings};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for the firmware patch service: "patching" an address registers
/// the interceptor under it, and the simulated firmware routes its write
/// calls through `fire`.
#[derive(Default)]
struct PatchService {
    hooks: HashMap<u64, (u32, Box<dyn RegisterWriteInterceptor>)>,
    next_handle: u64,
}

impl PatchService {
    /// Simulates the firmware calling the patched write routine at
    /// `address`: the hook runs first, then the "real" routine consumes the
    /// shadow copy instead of the original buffer.
    fn fire(&self, address: u32, payload: &mut WritePayload<'_>, caller: CallerContext) {
        for (hooked_address, interceptor) in self.hooks.values() {
            if *hooked_address != address {
                continue;
            }
            match interceptor.on_write(payload, caller) {
                Ok(Some(shadow)) => write_to_hardware(interceptor.path(), &shadow),
                Ok(None) => tracing::debug!(address, "write forwarded untouched"),
                Err(err) => tracing::error!(%err, "hook refused the write"),
            }
        }
    }
}

impl HookInstaller for PatchService {
    fn install(
        &mut self,
        path: WritePath,
        address: u32,
        interceptor: Box<dyn RegisterWriteInterceptor>,
    ) -> Result<HookHandle, InstallError> {
        self.next_handle += 1;
        tracing::debug!(?path, address, "hook installed");
        self.hooks.insert(self.next_handle, (address, interceptor));
        Ok(HookHandle(self.next_handle))
    }

    fn uninstall(&mut self, handle: HookHandle) {
        self.hooks.remove(&handle.0);
    }
}

/// The far end of the simulation: where the real write routine would push
/// the (possibly overridden) shadow data into the sensor-timing blocks.
fn write_to_hardware(path: WritePath, shadow: &ShadowPayload) {
    let entries = match shadow {
        ShadowPayload::Words16(words) => words.len(),
        ShadowPayload::Words32(words) => words.len(),
    };
    tracing::debug!(?path, entries, "shadow payload written to hardware");
}

fn dst_name(dst: u16) -> String {
    match dst {
        DST_CMOS => "CMOS".to_string(),
        DST_CMOS16 => "CMOS16".to_string(),
        d if d & 0xFFF0 != 0 => format!("{d:X}"),
        d => format!("ADTG{d}"),
    }
}

fn main() {
    println!("regwatch v0.1.0");

    let file_appender = tracing_appender::rolling::never(env::temp_dir(), "regwatch.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let model = args.first().map_or("5D3", String::as_str);
    let firmware = args.get(1).map_or("1.1.3", String::as_str);

    let Some(addresses) = WritePathAddresses::for_model(model, firmware) else {
        println!("no write-routine addresses known for {model} {firmware} :(");
        process::exit(1);
    };
    println!("simulating {model} {firmware}");

    let engine = Arc::new(Engine::new(Catalog::builtin()));
    let mut patcher = PatchService::default();
    let settings = Settings {
        grouping: GroupingMode::None,
        override_mode: OverrideMode::Static,
        intercept_engio: true,
    };

    let hooks = match engine.enable(&mut patcher, &addresses, settings) {
        Ok(hooks) => hooks,
        Err(err) => {
            println!("could not enable interception: {err}");
            process::exit(2);
        }
    };

    let liveview = CallerContext {
        task: 0x7A,
        pc: 0xFF0C_56A4,
    };
    let adtg_addr = addresses.get(WritePath::Adtg).unwrap();
    let cmos_addr = addresses.get(WritePath::Cmos).unwrap();
    let engio_addr = addresses.get(WritePath::Engio).unwrap();
    let drv_out_addr = addresses.get(WritePath::EngDrvOut).unwrap();

    for frame in 0u32..3 {
        // per-frame sensor timing reprogramming, as LiveView issues it
        let blanking = 0x0005 + frame;
        let mut adtg = WritePayload::Adtg {
            chip_select: 4,
            words: &[0x8060_0000 | blanking, 0x8172_0465, TERMINATOR_32],
        };
        patcher.fire(adtg_addr, &mut adtg, liveview);

        let mut cmos = WritePayload::Cmos {
            words: &[0x0003, 0x2123, TERMINATOR_16],
        };
        patcher.fire(cmos_addr, &mut cmos, liveview);

        let mut engio = WritePayload::Engio {
            words: &[0xC0F0_6008, 0x0404_0565, TERMINATOR_32],
        };
        patcher.fire(engio_addr, &mut engio, liveview);

        let mut fps = 0x0180;
        let mut drv_out = WritePayload::EngDrvOut {
            address: 0xC0F0_6014,
            value: &mut fps,
        };
        patcher.fire(drv_out_addr, &mut drv_out, liveview);

        engine.commit_readout();

        if frame == 0 {
            // from here on, shutter blanking is ours
            let key = RegisterKey::pack(0, 0x8060, 4);
            engine.set_override_display(key, 0x25).unwrap();
            engine.set_override_enabled(key, true).unwrap();
            tracing::info!("override armed for ADTG4[8060]");
        }
    }

    println!("{} registers tracked", engine.record_count());
    for view in engine.records() {
        let marker = if view.override_enabled {
            format!(" -> {:#x}", view.override_value)
        } else {
            String::new()
        };
        println!(
            "{:>6}[{:04X}]{} {:#x} (was {:#x}, {} changes){}  {}",
            dst_name(view.dst),
            view.reg,
            if view.is_nrzi { " N" } else { "" },
            view.display_value(),
            view.display_previous(),
            view.change_count,
            marker,
            view.description.unwrap_or(""),
        );
    }
    if engine.capacity_exhausted() {
        println!("warning: too many registers");
    }

    engine.disable(&mut patcher, hooks);
}
