use bitflags::bitflags;
use tracing::debug;

bitflags! {
    /// Flags selecting how a [`RandomXVm`](crate::RandomXVm) runs.
    ///
    /// The values match the reference C API. Flags never change a digest, only how it is
    /// computed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RandomXFlags: u32 {
        /// Request hardware AES.
        const HARD_AES = 2;
        /// Fast mode, hash with a full [`Dataset`](crate::Dataset).
        const FULL_MEM = 4;
        /// Run programs through compiled dispatch instead of the interpreter.
        ///
        /// Compiled programs are chains of closures built once per program, no native code is
        /// generated.
        const JIT = 8;
        /// Wipe the scratchpad and registers when the VM is dropped.
        const SECURE = 16;
    }
}

impl RandomXFlags {
    /// Light mode, interpreted, software AES.
    pub const DEFAULT: Self = Self::empty();

    /// The best flags for this machine, without [`RandomXFlags::FULL_MEM`] as that is a memory
    /// trade-off for the caller.
    pub fn recommended() -> Self {
        let mut flags = Self::DEFAULT;

        if hardware_aes_available() {
            flags |= Self::HARD_AES;
        }
        if cfg!(feature = "jit") {
            flags |= Self::JIT;
        }

        flags
    }
}

fn hardware_aes_available() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    return std::arch::is_x86_feature_detected!("aes");

    #[cfg(target_arch = "aarch64")]
    return std::arch::is_aarch64_feature_detected!("aes");

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    false
}

/// Where dataset items come from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    /// Items are computed from the [`Cache`](crate::Cache) on demand.
    Light,
    /// Items are read from the [`Dataset`](crate::Dataset).
    Fast,
}

/// How programs are executed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dispatch {
    /// Bytecode run by a `match` loop.
    Interpreted,
    /// Bytecode lowered to a chain of specialized closures, with `NOP`s removed.
    Compiled,
}

/// [`RandomXFlags`] resolved against what this build and machine support.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmOptions {
    /// Light or fast mode.
    pub mode: Mode,
    /// Interpreted or compiled dispatch.
    pub dispatch: Dispatch,
    /// Whether AES runs on hardware, the AES implementation detects this itself at runtime.
    pub hard_aes: bool,
    /// Whether the VM's registers and scratchpad are wiped on drop.
    pub secure: bool,
}

impl VmOptions {
    /// Resolves `flags`, unsupported requests fall back to their portable alternative.
    pub fn from_flags(flags: RandomXFlags) -> Self {
        let mode = if flags.contains(RandomXFlags::FULL_MEM) {
            Mode::Fast
        } else {
            Mode::Light
        };

        let dispatch = if flags.contains(RandomXFlags::JIT) {
            if cfg!(feature = "jit") {
                Dispatch::Compiled
            } else {
                debug!("Compiled dispatch is not built in, falling back to the interpreter.");
                Dispatch::Interpreted
            }
        } else {
            Dispatch::Interpreted
        };

        let hard_aes = hardware_aes_available();
        if flags.contains(RandomXFlags::HARD_AES) && !hard_aes {
            debug!("Hardware AES is not available, using software AES.");
        }

        Self {
            mode,
            dispatch,
            hard_aes,
            secure: flags.contains(RandomXFlags::SECURE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_values() {
        assert_eq!(RandomXFlags::DEFAULT.bits(), 0);
        assert_eq!(RandomXFlags::HARD_AES.bits(), 2);
        assert_eq!(RandomXFlags::FULL_MEM.bits(), 4);
        assert_eq!(RandomXFlags::JIT.bits(), 8);
        assert_eq!(RandomXFlags::SECURE.bits(), 16);
    }

    #[test]
    fn resolve() {
        let options = VmOptions::from_flags(RandomXFlags::FULL_MEM | RandomXFlags::SECURE);
        assert_eq!(options.mode, Mode::Fast);
        assert_eq!(options.dispatch, Dispatch::Interpreted);
        assert!(options.secure);

        let options = VmOptions::from_flags(RandomXFlags::JIT);
        assert_eq!(options.mode, Mode::Light);
        assert_eq!(options.dispatch == Dispatch::Compiled, cfg!(feature = "jit"));
    }

    #[test]
    fn recommended_is_light() {
        assert!(!RandomXFlags::recommended().contains(RandomXFlags::FULL_MEM));
    }
}
