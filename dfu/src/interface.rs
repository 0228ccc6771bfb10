use crate::{
    descriptor::*,
    error::{DfuError, Result},
    memory::MemoryInfo,
};

/// DFU capable alternate setting found during discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceCandidate {
    configuration: u8,
    interface: u8,
    alt_setting: u8,
    protocol: u8,
    name: Option<String>,
}

impl InterfaceCandidate {
    pub fn new(
        configuration: u8,
        interface: u8,
        alt_setting: u8,
        protocol: u8,
        name: Option<String>,
    ) -> Self {
        Self {
            configuration,
            interface,
            alt_setting,
            protocol,
            name,
        }
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    pub fn protocol(&self) -> u8 {
        self.protocol
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Device is in DFU mode rather than exposing a run-time interface.
    pub fn is_dfu_mode(&self) -> bool {
        self.protocol == DFU_PROTOCOL_DFU_MODE
    }

    /// DfuSe memory map encoded in the interface name.
    pub fn memory_info(&self) -> Result<MemoryInfo> {
        MemoryInfo::parse(self.name().ok_or(DfuError::NoMemoryMap)?)
    }
}

pub fn is_dfu_interface(class: u8, subclass: u8, protocol: u8) -> bool {
    class == DFU_CLASS
        && subclass == DFU_SUBCLASS
        && (protocol == DFU_PROTOCOL_RUNTIME || protocol == DFU_PROTOCOL_DFU_MODE)
}

/// Collect the DFU alternate settings of already parsed configurations.
///
/// `name` resolves an `iInterface` string index; it is not called for
/// index 0.
pub fn find_dfu_interfaces<F>(
    configs: &[ConfigurationDescriptor],
    mut name: F,
) -> Vec<InterfaceCandidate>
where
    F: FnMut(u8) -> Option<String>,
{
    configs
        .iter()
        .flat_map(|config| {
            config
                .interfaces()
                .map(move |intf| (config.configuration_value, intf))
        })
        .filter(|(_, intf)| {
            is_dfu_interface(
                intf.interface_class,
                intf.interface_subclass,
                intf.interface_protocol,
            )
        })
        .map(|(configuration, intf)| {
            InterfaceCandidate::new(
                configuration,
                intf.interface_number,
                intf.alternate_setting,
                intf.interface_protocol,
                match intf.interface_index {
                    0 => None,
                    idx => name(idx),
                },
            )
        })
        .collect()
}
