// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
  /// Every candidate scored 0, or the instance exposes no GPU at all.
  #[error("no physical device meets the renderer's mandatory requirements")]
  NoSuitableDevice,

  /// The driver refused something already validated as supported. Treat as unrecoverable.
  #[error("driver fault in {op}: {result:?}")]
  DriverFault { op: &'static str, result: vk::Result },

  #[error("out of device memory on every compatible memory type")]
  OutOfDeviceMemory,

  #[error("no memory type in bits {type_bits:#x} has {properties:?}")]
  NoMemoryType { type_bits: u32, properties: vk::MemoryPropertyFlags },

  #[error("no candidate format supports {features:?} with {tiling:?} tiling")]
  NoSupportedFormat { tiling: vk::ImageTiling, features: vk::FormatFeatureFlags },

  #[error("{op} failed: {result:?}")]
  Vk { op: &'static str, result: vk::Result },

  /// A device-dependent operation ran before `create_device` or after `destroy_device`.
  #[error("{0} needs a logical device")]
  NoDevice(&'static str),
}

impl DeviceError {
  pub fn vk(op: &'static str) -> impl FnOnce(vk::Result) -> DeviceError {
    move |result| DeviceError::Vk { op, result }
  }

  /// Fatal errors mean the environment can no longer be trusted; the embedding app should exit.
  pub fn is_fatal(&self) -> bool {
    matches!(self, DeviceError::DriverFault { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_driver_faults_are_fatal() {
    let fault = DeviceError::DriverFault { op: "vkCreateDevice", result: vk::Result::ERROR_INITIALIZATION_FAILED };
    assert!(fault.is_fatal());
    assert!(!DeviceError::NoSuitableDevice.is_fatal());
    assert!(!DeviceError::OutOfDeviceMemory.is_fatal());
  }

  #[test]
  fn message_carries_symbolic_code() {
    let fault = DeviceError::DriverFault { op: "vkCreateDevice", result: vk::Result::ERROR_DEVICE_LOST };
    let msg = fault.to_string();
    assert!(msg.contains("vkCreateDevice"));
    assert!(msg.contains("ERROR_DEVICE_LOST"));
  }

  #[test]
  fn vk_helper_tags_operation() {
    let e = Err::<(), _>(vk::Result::ERROR_OUT_OF_HOST_MEMORY).map_err(DeviceError::vk("vkCreateImage"));
    assert_eq!(e, Err(DeviceError::Vk { op: "vkCreateImage", result: vk::Result::ERROR_OUT_OF_HOST_MEMORY }));
  }
}
