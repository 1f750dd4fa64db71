use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{EngineError, InstallError};
use crate::intercept::{CallerContext, ShadowPayload, WritePayload};

/// The hardware write routines the engine interposes on. `CmosAlt` is a
/// second firmware entry point into the same CMOS payload family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WritePath {
    Adtg,
    Cmos,
    CmosAlt,
    Cmos16,
    Engio,
    EngDrvOut,
    EngDrvOuts,
}

impl WritePath {
    pub const ALL: [Self; 7] = [
        Self::Adtg,
        Self::Cmos,
        Self::CmosAlt,
        Self::Cmos16,
        Self::Engio,
        Self::EngDrvOut,
        Self::EngDrvOuts,
    ];
}

/// One interposed write family. The hook service calls `on_write` with the
/// in-flight payload; the result is the shadow copy to hand to the real
/// write routine, or `None` to forward the firmware's buffer untouched.
///
/// Hooks are not reentrant with themselves: the firmware finishes one write
/// call before issuing the next on the same interrupt level.
pub trait RegisterWriteInterceptor: Send + Sync {
    fn path(&self) -> WritePath;

    fn on_write(
        &self,
        payload: &mut WritePayload<'_>,
        caller: CallerContext,
    ) -> Result<Option<ShadowPayload>, EngineError>;
}

/// Opaque token for one installed hook, minted by the installation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(pub u64);

/// Black-box patch service that redirects a firmware function address into an
/// interceptor. Installation may fail (unpatchable address, already patched);
/// the engine never retries, it reports upward and stays inactive.
pub trait HookInstaller {
    fn install(
        &mut self,
        path: WritePath,
        address: u32,
        interceptor: Box<dyn RegisterWriteInterceptor>,
    ) -> Result<HookHandle, InstallError>;

    fn uninstall(&mut self, handle: HookHandle);
}

/// Resolved addresses of the real write routines for one camera model and
/// firmware revision. Paths the model does not expose stay `None` and are
/// simply not hooked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritePathAddresses {
    pub adtg: Option<u32>,
    pub cmos: Option<u32>,
    pub cmos_alt: Option<u32>,
    pub cmos16: Option<u32>,
    pub engio: Option<u32>,
    pub eng_drv_out: Option<u32>,
    pub eng_drv_outs: Option<u32>,
}

impl WritePathAddresses {
    #[must_use]
    pub const fn get(self, path: WritePath) -> Option<u32> {
        match path {
            WritePath::Adtg => self.adtg,
            WritePath::Cmos => self.cmos,
            WritePath::CmosAlt => self.cmos_alt,
            WritePath::Cmos16 => self.cmos16,
            WritePath::Engio => self.engio,
            WritePath::EngDrvOut => self.eng_drv_out,
            WritePath::EngDrvOuts => self.eng_drv_outs,
        }
    }

    /// Looks up the address table for a camera model + firmware revision.
    /// An unknown pair returns `None` and the feature cannot enable.
    #[must_use]
    pub fn for_model(model: &str, firmware: &str) -> Option<Self> {
        match (model, firmware) {
            ("5D3", "1.1.3") => Some(Self {
                adtg: Some(0x0001_1644),
                cmos: Some(0x0001_19CC),
                cmos_alt: Some(0x0001_1784),
                cmos16: Some(0x0001_1AB8),
                engio: Some(0xFF28_CC3C),
                eng_drv_out: Some(0xFF28_C92C),
                ..Self::default()
            }),
            ("5D3", "1.2.3") => Some(Self {
                adtg: Some(0x0001_1644),
                cmos: Some(0x0001_19CC),
                cmos_alt: Some(0x0001_1784),
                cmos16: Some(0x0001_1AB8),
                ..Self::default()
            }),
            ("5D2", "2.1.2") => Some(Self {
                adtg: Some(0xFFA3_5CBC),
                cmos: Some(0xFFA3_5E70),
                engio: Some(0xFF9A_5618),
                eng_drv_outs: Some(0xFF9A_5554),
                ..Self::default()
            }),
            ("500D", "1.1.1") => Some(Self {
                adtg: Some(0xFF22_F8F4),
                cmos: Some(0xFF22_F9DC),
                ..Self::default()
            }),
            ("550D", "1.0.9") => Some(Self {
                adtg: Some(0xFF27_EE34),
                cmos: Some(0xFF27_F028),
                ..Self::default()
            }),
            ("60D", "1.1.1") => Some(Self {
                adtg: Some(0xFF2C_9788),
                cmos: Some(0xFF2C_997C),
                engio: Some(0xFF1C_5A68),
                eng_drv_out: Some(0xFF1C_56A4),
                ..Self::default()
            }),
            ("50D", "1.0.9") => Some(Self {
                adtg: Some(0xFFA1_1FDC),
                cmos: Some(0xFFA1_2190),
                ..Self::default()
            }),
            ("6D", "1.1.3") => Some(Self {
                adtg: Some(0x0002_4108),
                cmos: Some(0x0002_445C),
                cmos_alt: Some(0x0002_420C),
                cmos16: Some(0x0002_4548),
                ..Self::default()
            }),
            ("EOSM", "2.0.2") => Some(Self {
                adtg: Some(0x0002_986C),
                cmos: Some(0x0002_998C),
                ..Self::default()
            }),
            ("600D", "1.0.2") => Some(Self {
                adtg: Some(0xFF2D_CEF4),
                cmos: Some(0xFF2D_D0E8),
                ..Self::default()
            }),
            ("650D", "1.0.4") | ("700D", "1.1.1") => Some(Self {
                adtg: Some(0x0001_78FC),
                cmos: Some(0x0001_7A1C),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

/// Binds one write path to a shared engine for the installer's benefit.
pub(crate) struct PathInterceptor {
    pub(crate) engine: Arc<Engine>,
    pub(crate) path: WritePath,
}

impl RegisterWriteInterceptor for PathInterceptor {
    fn path(&self) -> WritePath {
        self.path
    }

    fn on_write(
        &self,
        payload: &mut WritePayload<'_>,
        caller: CallerContext,
    ) -> Result<Option<ShadowPayload>, EngineError> {
        self.engine.on_write(payload, caller)
    }
}

/// Hooks installed for one enabled session; hand back to `Engine::disable`.
#[derive(Debug)]
pub struct InstalledHooks {
    pub(crate) handles: Vec<(WritePath, HookHandle)>,
}

impl InstalledHooks {
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = WritePath> + '_ {
        self.handles.iter().map(|(path, _)| *path)
    }
}

/// Installs a hook on every configured path, all or nothing: one failure
/// rolls back everything already installed.
pub(crate) fn install_all(
    engine: &Arc<Engine>,
    installer: &mut dyn HookInstaller,
    addresses: &WritePathAddresses,
) -> Result<InstalledHooks, InstallError> {
    let mut handles = Vec::new();
    for path in WritePath::ALL {
        let Some(address) = addresses.get(path) else {
            continue;
        };
        let interceptor = Box::new(PathInterceptor {
            engine: Arc::clone(engine),
            path,
        });
        match installer.install(path, address, interceptor) {
            Ok(handle) => handles.push((path, handle)),
            Err(err) => {
                tracing::error!(%err, "hook installation failed, rolling back");
                for (_, handle) in handles {
                    installer.uninstall(handle);
                }
                return Err(err);
            }
        }
    }
    Ok(InstalledHooks { handles })
}

pub(crate) fn uninstall_all(installer: &mut dyn HookInstaller, hooks: InstalledHooks) {
    for (_, handle) in hooks.handles {
        installer.uninstall(handle);
    }
}
