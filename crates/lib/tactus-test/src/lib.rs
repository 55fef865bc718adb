//! Helpers for driving a tactus VM in tests.

use std::sync::{Arc, Mutex};

use tactus_runtime::vm::{Vm, VmConfig, VmController};

/// A VM with both console sinks captured into strings.
pub struct TestVm {
    pub vm: Vm,
    pub controller: VmController,
    output: Arc<Mutex<String>>,
    errors: Arc<Mutex<String>>,
}

/// Build a started VM whose chout/cherr are captured for assertions.
pub fn test_vm(config: VmConfig) -> TestVm {
    let (mut vm, controller) = Vm::new(config);
    let output = Arc::new(Mutex::new(String::new()));
    let errors = Arc::new(Mutex::new(String::new()));
    let chout = vm.chout();
    let cherr = vm.cherr();
    let sink = output.clone();
    vm.store
        .console_mut(chout)
        .set_output_callback(Some(Box::new(move |s: &str| {
            sink.lock().unwrap().push_str(s)
        })));
    let sink = errors.clone();
    vm.store
        .console_mut(cherr)
        .set_output_callback(Some(Box::new(move |s: &str| {
            sink.lock().unwrap().push_str(s)
        })));
    vm.start();
    TestVm {
        vm,
        controller,
        output,
        errors,
    }
}

/// `test_vm` with halt-on-empty disabled, the usual setup for scenarios
/// that outlive their shreds.
pub fn test_vm_no_halt() -> TestVm {
    test_vm(VmConfig {
        halt_on_empty: false,
        ..Default::default()
    })
}

impl TestVm {
    /// Drive the VM for `frames` frames of silence.
    pub fn run_frames(&mut self, frames: usize) -> bool {
        let in_ch = self.vm.config().adc_channels as usize;
        let out_ch = self.vm.config().dac_channels as usize;
        let input = vec![0.0f64; frames * in_ch];
        let mut output = vec![0.0f64; frames * out_ch];
        self.vm.run(frames, &input, &mut output)
    }

    /// Everything written through chout so far.
    pub fn output(&self) -> String {
        self.output.lock().unwrap().clone()
    }

    /// Everything written through cherr so far.
    pub fn errors(&self) -> String {
        self.errors.lock().unwrap().clone()
    }
}
