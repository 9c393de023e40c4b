//! The host reference device.
//!
//! Compiles kernel source by parsing it into an internal program and
//! dispatches launches by interpreting that program across the work range.
//! Device memory is plain byte vectors. This is the device the runtime
//! selects by default and the one the test suite runs against.

mod exec;
mod parser;

use parser::HostProgram;

use crate::backend::{Device, DeviceBufferId, DeviceError, ProgramId};

pub struct HostDevice {
    programs: Vec<HostProgram>,
    buffers: Vec<Option<Vec<u8>>>,
}

impl HostDevice {
    pub fn new() -> Self {
        HostDevice { programs: Vec::new(), buffers: Vec::new() }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn compile(&mut self, source: &str) -> Result<ProgramId, DeviceError> {
        let program = parser::parse(source).map_err(|log| DeviceError::Build { log })?;
        let id = ProgramId(self.programs.len() as u32);
        self.programs.push(program);
        Ok(id)
    }

    fn dispatch(
        &mut self,
        program: ProgramId,
        global_size: usize,
        args: &[DeviceBufferId],
    ) -> Result<(), DeviceError> {
        let prog = self
            .programs
            .get(program.0 as usize)
            .ok_or_else(|| DeviceError::Dispatch(format!("unknown program {}", program.0)))?;
        exec::run(prog, global_size, &mut self.buffers, args).map_err(DeviceError::Dispatch)
    }

    fn alloc(&mut self, bytes: usize) -> DeviceBufferId {
        let id = DeviceBufferId(self.buffers.len() as u32);
        self.buffers.push(Some(vec![0u8; bytes]));
        id
    }

    fn free(&mut self, buffer: DeviceBufferId) {
        let slot = self
            .buffers
            .get_mut(buffer.0 as usize)
            .unwrap_or_else(|| panic!("free of unknown buffer {}", buffer.0));
        assert!(slot.is_some(), "double free of buffer {}", buffer.0);
        *slot = None;
    }

    fn write(&mut self, buffer: DeviceBufferId, offset: usize, data: &[u8]) {
        let bytes = self.buffers[buffer.0 as usize]
            .as_deref_mut()
            .unwrap_or_else(|| panic!("write to freed buffer {}", buffer.0));
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read(&self, buffer: DeviceBufferId, offset: usize, dst: &mut [u8]) {
        let bytes = self.buffers[buffer.0 as usize]
            .as_deref()
            .unwrap_or_else(|| panic!("read from freed buffer {}", buffer.0));
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_f32(device: &HostDevice, buffer: DeviceBufferId, count: usize) -> Vec<f32> {
        let mut bytes = vec![0u8; count * 4];
        device.read(buffer, 0, &mut bytes);
        bytes.chunks_exact(4).map(|c| f32::from_ne_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn test_compile_and_dispatch_broadcast_add() {
        let mut device = HostDevice::new();
        let out = device.alloc(8 * 4);
        let program = device
            .compile(
                "__kernel void main(__global float * buffer0){\n\
                 float v0 = 2;\n\
                 int v1 = get_global_id(0);\n\
                 float v2 = v0 + v1;\n\
                 buffer0[get_global_id(0)] = v2;\n\
                 }",
            )
            .unwrap();
        device.dispatch(program, 8, &[out]).unwrap();
        let data = read_f32(&device, out, 8);
        assert_eq!(data, (0..8).map(|i| 2.0 + i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_masked_store_load_round_trip() {
        let mut device = HostDevice::new();
        let buf = device.alloc(8 * 4);
        // Store 3*gid at even work items, then read everything back through a
        // masked load with the same mask.
        let store = device
            .compile(
                "__kernel void main(__global int * buffer0, __global int * buffer1){\n\
                 int v0 = get_global_id(0);\n\
                 int v1 = 2;\n\
                 int v2 = v0 % v1;\n\
                 int v3 = 0;\n\
                 bool v4 = v2 == v3;\n\
                 int v5 = 3;\n\
                 int v6 = v0 * v5;\n\
                 if(v4){ buffer0[v0] = v6; }\n\
                 int v7 = v4 ? buffer0[v0] : 0;\n\
                 buffer1[get_global_id(0)] = v7;\n\
                 }",
            )
            .unwrap();
        let out = device.alloc(8 * 4);
        device.dispatch(store, 8, &[buf, out]).unwrap();
        let mut bytes = vec![0u8; 8 * 4];
        device.read(out, 0, &mut bytes);
        let data: Vec<i32> =
            bytes.chunks_exact(4).map(|c| i32::from_ne_bytes(c.try_into().unwrap())).collect();
        assert_eq!(data, vec![0, 0, 6, 0, 12, 0, 18, 0]);
    }

    #[test]
    fn test_build_failure_carries_log() {
        let mut device = HostDevice::new();
        let err = device.compile("__kernel void main(){\nfloat v0 = nonsense(v9);\n}");
        match err {
            Err(DeviceError::Build { log }) => assert!(log.contains("nonsense")),
            other => panic!("expected build failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut device = HostDevice::new();
        let buf = device.alloc(16);
        device.write(buf, 4, &[1, 2, 3, 4]);
        let mut back = [0u8; 4];
        device.read(buf, 4, &mut back);
        assert_eq!(back, [1, 2, 3, 4]);
    }
}
