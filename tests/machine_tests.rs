use std::cell::RefCell;
use std::rc::Rc;

use femtos::{Duration, Frequency};

use emu_z80::instructions::{IndexRegisterHalf, InterruptMode, Register, RegisterPair};
use emu_z80::memory::Memory;
use emu_z80::port::PortIo;
use emu_z80::state::{Flags, Z80, Z80Error, Z80State};

const ORIGIN: u16 = 0xA000;

fn power_on() -> Z80 {
    Z80::new(Frequency::from_mhz(4), Memory::new(), None)
}

/// Load a program at the origin and run it to its HALT
fn run_program(cpu: &mut Z80, bytes: &[u8]) {
    cpu.memory.load(ORIGIN, bytes);
    cpu.state.pc = ORIGIN;
    for _ in 0..10_000 {
        if cpu.state.halted {
            return;
        }
        assert!(cpu.step());
    }
    panic!("program did not reach a halt");
}

#[derive(Clone, Default)]
struct BusRecorder {
    reads: Rc<RefCell<Vec<u16>>>,
    writes: Rc<RefCell<Vec<(u16, u8)>>>,
    input: u8,
}

impl PortIo for BusRecorder {
    fn read(&mut self, addr: u16) -> u8 {
        self.reads.borrow_mut().push(addr);
        self.input
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.writes.borrow_mut().push((addr, value));
    }
}

#[test]
fn scenario_register_to_register_load() {
    let mut cpu = power_on();
    cpu.state.set_register(Register::B, 0x10);

    run_program(&mut cpu, &[0x41, 0x76]);

    assert_eq!(cpu.state.get_register(Register::C), 0x10);
    assert_eq!(cpu.state.pc, 0xA002);
    assert_eq!(cpu.state.t_states, 8);
}

#[test]
fn scenario_load_immediate_word() {
    let mut cpu = power_on();

    run_program(&mut cpu, &[0x21, 0x00, 0x50, 0x76]);

    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0x5000);
    assert_eq!(cpu.state.t_states, 14);
}

#[test]
fn scenario_block_copy() {
    let mut cpu = power_on();
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x1111);
    cpu.state.set_register_pair_value(RegisterPair::DE, 0x2222);
    cpu.state.set_register_pair_value(RegisterPair::BC, 3);
    cpu.memory.load(0x1111, &[0x88, 0x36, 0xA5]);

    run_program(&mut cpu, &[0xED, 0xB0, 0x76]);

    assert_eq!(cpu.memory.read_u8(0x2222), 0x88);
    assert_eq!(cpu.memory.read_u8(0x2223), 0x36);
    assert_eq!(cpu.memory.read_u8(0x2224), 0xA5);
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::BC), 0);
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0x1114);
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::DE), 0x2225);
    assert!(!cpu.state.get_flag(Flags::HalfCarry));
    assert!(!cpu.state.get_flag(Flags::Parity));
    assert!(!cpu.state.get_flag(Flags::AddSubtract));
    // two repeating iterations, one terminating, plus the halt
    assert_eq!(cpu.state.t_states, 21 + 21 + 16 + 4);
}

#[test]
fn scenario_decimal_adjust_chain() {
    let mut cpu = power_on();
    cpu.state.set_register(Register::A, 0x0E);
    cpu.state.set_register(Register::B, 0x0F);
    cpu.state.set_register(Register::C, 0x90);
    cpu.state.set_register(Register::D, 0x40);

    // AND B; ADD A,C; DAA; ADC A,D; DAA
    run_program(&mut cpu, &[0xA0, 0x81, 0x27, 0x8A, 0x27, 0x76]);

    assert_eq!(cpu.state.get_register(Register::A), 0x45);
}

#[test]
fn scenario_mode2_interrupt() {
    let mut cpu = power_on();
    cpu.state.im = InterruptMode::Mode2;
    cpu.state.i = 0x10;
    cpu.state.iff1 = true;
    cpu.state.iff2 = true;
    cpu.state.pc = ORIGIN;
    cpu.memory.write_leu16(0x1000, 0x1234);
    cpu.memory.write_u8(0x1234, 0x76);

    assert!(cpu.maskable_interrupt());

    assert_eq!(cpu.state.pc, 0x1234);
    assert_eq!(cpu.memory.read_leu16(cpu.state.sp), ORIGIN);
    assert!(!cpu.state.iff1);
    assert!(!cpu.state.iff2);
    assert_eq!(cpu.state.t_states, 19);

    assert!(cpu.step());
    assert!(cpu.state.halted);
}

#[test]
fn scenario_bit_test_memory() {
    let mut cpu = power_on();
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x4444);
    cpu.state.set_flag(Flags::Zero, true);
    cpu.memory.write_u8(0x4444, 0x10);

    run_program(&mut cpu, &[0xCB, 0x66, 0x76]);

    assert!(!cpu.state.get_flag(Flags::Zero));
    assert!(cpu.state.get_flag(Flags::HalfCarry));
    assert!(!cpu.state.get_flag(Flags::AddSubtract));
    assert_eq!(cpu.memory.read_u8(0x4444), 0x10);
}

#[test]
fn register_pair_round_trips() {
    let mut state = Z80State::default();

    let pairs = [
        (RegisterPair::BC, Register::B, Register::C),
        (RegisterPair::DE, Register::D, Register::E),
        (RegisterPair::HL, Register::H, Register::L),
        (RegisterPair::AF, Register::A, Register::F),
    ];

    for (pair, high, low) in pairs {
        state.set_register_pair_value(pair, 0xA55A);
        assert_eq!(state.get_register_pair_value(pair), 0xA55A);
        assert_eq!(state.get_register(high), 0xA5);
        assert_eq!(state.get_register(low), 0x5A);

        state.set_register(high, 0x12);
        state.set_register(low, 0x34);
        assert_eq!(state.get_register_pair_value(pair), 0x1234);
    }

    for (pair, high, low) in [
        (RegisterPair::IX, IndexRegisterHalf::IXH, IndexRegisterHalf::IXL),
        (RegisterPair::IY, IndexRegisterHalf::IYH, IndexRegisterHalf::IYL),
    ] {
        state.set_register_pair_value(pair, 0xA55A);
        assert_eq!(state.get_register_pair_value(pair), 0xA55A);
        assert_eq!(state.get_index_register_half_value(high), 0xA5);
        assert_eq!(state.get_index_register_half_value(low), 0x5A);

        state.set_index_register_half_value(high, 0x12);
        state.set_index_register_half_value(low, 0x34);
        assert_eq!(state.get_register_pair_value(pair), 0x1234);
    }
}

#[test]
fn exchange_involutions() {
    let mut cpu = power_on();
    cpu.state.reg = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    cpu.state.shadow_reg = [0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98];

    // EX AF,AF'; EX AF,AF'; EXX; EXX; EX DE,HL; EX DE,HL
    run_program(&mut cpu, &[0x08, 0x08, 0xD9, 0xD9, 0xEB, 0xEB, 0x76]);

    assert_eq!(cpu.state.reg, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    assert_eq!(cpu.state.shadow_reg, [0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98]);
}

#[test]
fn exchange_swaps_banks() {
    let mut cpu = power_on();
    cpu.state.reg = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    cpu.state.shadow_reg = [0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98];

    run_program(&mut cpu, &[0xD9, 0x76]);

    // BC, DE, and HL change banks; AF stays put
    assert_eq!(cpu.state.reg, [0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x07, 0x08]);
    assert_eq!(cpu.state.shadow_reg, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x97, 0x98]);
}

#[test]
fn negate_twice_returns_accumulator() {
    let mut cpu = power_on();
    cpu.state.set_register(Register::A, 0x55);
    run_program(&mut cpu, &[0xED, 0x44, 0xED, 0x44, 0x76]);
    assert_eq!(cpu.state.get_register(Register::A), 0x55);
    assert!(cpu.state.get_flag(Flags::Carry));

    let mut cpu = power_on();
    cpu.state.set_register(Register::A, 0x00);
    cpu.state.set_flag(Flags::Carry, false);
    run_program(&mut cpu, &[0xED, 0x44, 0xED, 0x44, 0x76]);
    assert_eq!(cpu.state.get_register(Register::A), 0x00);
    assert!(!cpu.state.get_flag(Flags::Carry));
}

#[test]
fn complement_twice_is_identity() {
    let mut cpu = power_on();
    cpu.state.set_register(Register::A, 0x3C);
    run_program(&mut cpu, &[0x2F, 0x2F, 0x76]);
    assert_eq!(cpu.state.get_register(Register::A), 0x3C);
    assert!(cpu.state.get_flag(Flags::HalfCarry));
    assert!(cpu.state.get_flag(Flags::AddSubtract));
}

#[test]
fn push_pop_is_identity() {
    let mut cpu = power_on();
    cpu.state.sp = 0x8000;
    cpu.state.set_register_pair_value(RegisterPair::BC, 0xBEEF);

    run_program(&mut cpu, &[0xC5, 0xC1, 0x76]);

    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::BC), 0xBEEF);
    assert_eq!(cpu.state.sp, 0x8000);
}

#[test]
fn pop_af_restores_undocumented_flag_bits() {
    let mut cpu = power_on();
    cpu.state.sp = 0x8000;
    cpu.memory.write_leu16(0x8000, 0xABCD);

    run_program(&mut cpu, &[0xF1, 0x76]);

    assert_eq!(cpu.state.get_register(Register::A), 0xAB);
    assert_eq!(cpu.state.get_register(Register::F), 0xCD);
}

#[test]
fn exchange_stack_with_hl() {
    let mut cpu = power_on();
    cpu.state.sp = 0x8000;
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x1234);
    cpu.memory.write_leu16(0x8000, 0xBEEF);

    run_program(&mut cpu, &[0xE3, 0x76]);

    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0xBEEF);
    assert_eq!(cpu.memory.read_leu16(0x8000), 0x1234);
    assert_eq!(cpu.state.sp, 0x8000);
}

#[test]
fn block_compare_stops_on_match() {
    let mut cpu = power_on();
    cpu.memory.load(0x4000, &[0x11, 0x22, 0x33, 0x44, 0x55]);
    cpu.state.set_register(Register::A, 0x33);
    cpu.state.set_register_pair_value(RegisterPair::BC, 5);
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x4000);

    run_program(&mut cpu, &[0xED, 0xB1, 0x76]);

    // three bytes examined before the match terminates the loop
    assert!(cpu.state.get_flag(Flags::Zero));
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::BC), 2);
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0x4003);
    assert!(cpu.state.get_flag(Flags::Parity));
    assert_eq!(cpu.state.t_states, 21 + 21 + 16 + 4);
}

#[test]
fn and_flag_table() {
    let mut cpu = power_on();
    cpu.memory.load(ORIGIN, &[0xA0]);

    for value in 0..=255u8 {
        cpu.state.pc = ORIGIN;
        cpu.state.set_register(Register::A, 0xFF);
        cpu.state.set_register(Register::B, value);
        assert!(cpu.step());

        assert_eq!(cpu.state.get_register(Register::A), value);
        assert_eq!(cpu.state.get_flag(Flags::Sign), (value & 0x80) != 0, "S for {:#04x}", value);
        assert_eq!(cpu.state.get_flag(Flags::Zero), value == 0, "Z for {:#04x}", value);
        assert!(cpu.state.get_flag(Flags::HalfCarry), "H for {:#04x}", value);
        assert!(!cpu.state.get_flag(Flags::AddSubtract), "N for {:#04x}", value);
        assert!(!cpu.state.get_flag(Flags::Carry), "C for {:#04x}", value);
        assert_eq!(cpu.state.get_flag(Flags::Parity), value.count_ones() % 2 == 0, "PV for {:#04x}", value);
        assert_eq!(cpu.state.get_flag(Flags::F3), (value & 0x08) != 0, "F3 for {:#04x}", value);
        assert_eq!(cpu.state.get_flag(Flags::F5), (value & 0x20) != 0, "F5 for {:#04x}", value);
    }
}

#[test]
fn add_carry_laws() {
    let mut cpu = power_on();
    cpu.memory.load(ORIGIN, &[0x80]);

    for x in 0..=255u16 {
        for y in 0..=255u16 {
            cpu.state.pc = ORIGIN;
            cpu.state.set_register(Register::A, x as u8);
            cpu.state.set_register(Register::B, y as u8);
            assert!(cpu.step());

            assert_eq!(cpu.state.get_register(Register::A), ((x + y) & 0xFF) as u8);
            assert_eq!(cpu.state.get_flag(Flags::Carry), x + y > 0xFF, "C for {:#04x}+{:#04x}", x, y);
            assert_eq!(cpu.state.get_flag(Flags::HalfCarry), (x & 0x0F) + (y & 0x0F) > 0x0F, "H for {:#04x}+{:#04x}", x, y);
        }
    }
}

#[test]
fn rotate_group_tables() {
    // (sub-opcode for B, result, carry-out)
    #[allow(clippy::type_complexity)]
    let ops: [(u8, fn(u8, bool) -> u8, fn(u8) -> bool); 8] = [
        (0x00, |x, _| (x << 1) | (x >> 7), |x| (x & 0x80) != 0),          // RLC
        (0x08, |x, _| (x >> 1) | ((x & 1) << 7), |x| (x & 0x01) != 0),    // RRC
        (0x10, |x, c| (x << 1) | (c as u8), |x| (x & 0x80) != 0),         // RL
        (0x18, |x, c| (x >> 1) | ((c as u8) << 7), |x| (x & 0x01) != 0),  // RR
        (0x20, |x, _| x << 1, |x| (x & 0x80) != 0),                       // SLA
        (0x28, |x, _| (x >> 1) | (x & 0x80), |x| (x & 0x01) != 0),        // SRA
        (0x30, |x, _| (x << 1) | 0x01, |x| (x & 0x80) != 0),              // SLL
        (0x38, |x, _| x >> 1, |x| (x & 0x01) != 0),                       // SRL
    ];

    let mut cpu = power_on();
    for (op, result_fn, carry_fn) in ops {
        cpu.memory.load(ORIGIN, &[0xCB, op]);
        for x in 0..=255u8 {
            for carry_in in [false, true] {
                cpu.state.pc = ORIGIN;
                cpu.state.set_register(Register::B, x);
                cpu.state.set_register(Register::F, carry_in as u8);
                assert!(cpu.step());

                assert_eq!(cpu.state.get_register(Register::B), result_fn(x, carry_in), "result of op {:#04x} on {:#04x}", op, x);
                assert_eq!(cpu.state.get_flag(Flags::Carry), carry_fn(x), "carry of op {:#04x} on {:#04x}", op, x);
            }
        }
    }
}

#[test]
fn halt_idles_until_interrupt() {
    let mut cpu = power_on();
    cpu.memory.load(ORIGIN, &[0x76]);
    cpu.state.pc = ORIGIN;

    assert!(cpu.step());
    assert!(cpu.state.halted);
    assert_eq!(cpu.state.pc, ORIGIN + 1);
    assert_eq!(cpu.state.t_states, 4);

    // each further step consumes the halt byte again
    assert!(cpu.step());
    assert!(cpu.state.halted);
    assert_eq!(cpu.state.pc, ORIGIN + 1);
    assert_eq!(cpu.state.t_states, 8);

    cpu.non_maskable_interrupt();
    assert!(!cpu.state.halted);
    assert_eq!(cpu.state.pc, 0x0066);
    assert_eq!(cpu.memory.read_leu16(cpu.state.sp), ORIGIN + 1);
    assert_eq!(cpu.state.t_states, 8 + 11);
}

#[test]
fn nmi_preserves_iff2_and_retn_restores() {
    let mut cpu = power_on();
    cpu.state.iff1 = true;
    cpu.state.iff2 = true;
    cpu.state.pc = ORIGIN;
    cpu.memory.load(0x0066, &[0xED, 0x45]);

    cpu.non_maskable_interrupt();
    assert!(!cpu.state.iff1);
    assert!(cpu.state.iff2);
    assert_eq!(cpu.state.pc, 0x0066);

    assert!(cpu.step());
    assert_eq!(cpu.state.pc, ORIGIN);
    assert!(cpu.state.iff1);
}

#[test]
fn maskable_interrupt_requires_iff1() {
    let mut cpu = power_on();
    cpu.state.pc = ORIGIN;

    assert!(!cpu.maskable_interrupt());
    assert_eq!(cpu.state.pc, ORIGIN);
    assert_eq!(cpu.state.t_states, 0);
}

#[test]
fn mode1_interrupt_vectors_to_0x38() {
    let mut cpu = power_on();
    cpu.state.im = InterruptMode::Mode1;
    cpu.state.iff1 = true;
    cpu.state.pc = ORIGIN;

    assert!(cpu.maskable_interrupt());
    assert_eq!(cpu.state.pc, 0x0038);
    assert_eq!(cpu.memory.read_leu16(cpu.state.sp), ORIGIN);
    assert_eq!(cpu.state.t_states, 13);
}

#[test]
fn mode0_interrupt_only_costs_time() {
    let mut cpu = power_on();
    cpu.state.im = InterruptMode::Mode0;
    cpu.state.iff1 = true;
    cpu.state.pc = ORIGIN;
    let sp = cpu.state.sp;

    assert!(cpu.maskable_interrupt());
    assert_eq!(cpu.state.pc, ORIGIN);
    assert_eq!(cpu.state.sp, sp);
    assert!(!cpu.state.iff1);
    assert!(!cpu.state.iff2);
    assert_eq!(cpu.state.t_states, 13);
}

#[test]
fn refresh_register_increments_per_opcode_fetch() {
    let mut cpu = power_on();
    cpu.memory.load(ORIGIN, &[0x00, 0xCB, 0x47, 0xDD, 0xCB, 0x05, 0x46]);
    cpu.state.pc = ORIGIN;
    cpu.state.r = 0x00;

    assert!(cpu.step());
    assert_eq!(cpu.state.r, 0x01);

    assert!(cpu.step());
    assert_eq!(cpu.state.r, 0x03);

    assert!(cpu.step());
    assert_eq!(cpu.state.r, 0x06);
}

#[test]
fn refresh_register_preserves_bit_seven() {
    let mut cpu = power_on();
    cpu.memory.load(ORIGIN, &[0x00]);
    cpu.state.pc = ORIGIN;
    cpu.state.r = 0xFF;

    assert!(cpu.step());
    assert_eq!(cpu.state.r, 0x80);
}

#[test]
fn load_refresh_register_writes_all_bits() {
    let mut cpu = power_on();
    cpu.state.set_register(Register::A, 0x92);

    run_program(&mut cpu, &[0xED, 0x4F, 0x76]);

    // the halt fetch bumps the low bits afterwards
    assert_eq!(cpu.state.r & 0x80, 0x80);
    assert_eq!(cpu.state.r, 0x93);
}

#[test]
fn load_accumulator_from_interrupt_register() {
    let mut cpu = power_on();
    cpu.state.i = 0x00;
    cpu.state.iff2 = true;

    run_program(&mut cpu, &[0xED, 0x57, 0x76]);

    assert_eq!(cpu.state.get_register(Register::A), 0x00);
    assert!(cpu.state.get_flag(Flags::Zero));
    assert!(cpu.state.get_flag(Flags::Parity));
    assert!(!cpu.state.get_flag(Flags::Sign));
}

#[test]
fn default_ports_read_high_address_byte() {
    let mut cpu = power_on();
    cpu.state.set_register(Register::A, 0xAB);
    cpu.state.set_register(Register::F, 0x55);

    // IN A,(n) drives (A << 8) | n and leaves the flags alone
    run_program(&mut cpu, &[0xDB, 0x34, 0x76]);

    assert_eq!(cpu.state.get_register(Register::A), 0xAB);
    assert_eq!(cpu.state.get_register(Register::F), 0x55);
}

#[test]
fn port_bus_addresses() {
    let recorder = BusRecorder {
        input: 0x80,
        ..Default::default()
    };
    let reads = recorder.reads.clone();
    let writes = recorder.writes.clone();

    let mut cpu = Z80::new(Frequency::from_mhz(4), Memory::new(), Some(Box::new(recorder)));
    cpu.state.set_register(Register::B, 0x12);
    cpu.state.set_register(Register::C, 0x34);
    cpu.state.set_register(Register::A, 0x55);

    // IN A,(C); OUT (C),A; OUT (n),A; OUT (C),0
    run_program(&mut cpu, &[0xED, 0x78, 0xED, 0x79, 0xD3, 0x7F, 0xED, 0x71, 0x76]);

    assert_eq!(cpu.state.get_register(Register::A), 0x80);
    assert!(cpu.state.get_flag(Flags::Sign));
    assert_eq!(*reads.borrow(), vec![0x1234]);
    assert_eq!(*writes.borrow(), vec![(0x1234, 0x80), (0x807F, 0x80), (0x1234, 0x00)]);
}

#[test]
fn block_input_stores_and_counts_down() {
    let recorder = BusRecorder {
        input: 0x7F,
        ..Default::default()
    };
    let reads = recorder.reads.clone();

    let mut cpu = Z80::new(Frequency::from_mhz(4), Memory::new(), Some(Box::new(recorder)));
    cpu.state.set_register(Register::B, 0x02);
    cpu.state.set_register(Register::C, 0xFE);
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x8000);

    run_program(&mut cpu, &[0xED, 0xA2, 0x76]);

    assert_eq!(*reads.borrow(), vec![0x02FE]);
    assert_eq!(cpu.memory.read_u8(0x8000), 0x7F);
    assert_eq!(cpu.state.get_register(Register::B), 0x01);
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0x8001);
    assert!(!cpu.state.get_flag(Flags::Zero));
    assert!(cpu.state.get_flag(Flags::Carry));
    assert!(cpu.state.get_flag(Flags::HalfCarry));
}

#[test]
fn block_output_presents_decremented_b() {
    let recorder = BusRecorder::default();
    let writes = recorder.writes.clone();

    let mut cpu = Z80::new(Frequency::from_mhz(4), Memory::new(), Some(Box::new(recorder)));
    cpu.memory.write_u8(0x8000, 0x99);
    cpu.state.set_register(Register::B, 0x02);
    cpu.state.set_register(Register::C, 0x34);
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x8000);

    run_program(&mut cpu, &[0xED, 0xA3, 0x76]);

    assert_eq!(*writes.borrow(), vec![(0x0134, 0x99)]);
    assert_eq!(cpu.state.get_register(Register::B), 0x01);
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0x8001);
    assert!(!cpu.state.get_flag(Flags::Zero));
}

#[test]
fn block_output_repeats_until_b_is_zero() {
    let recorder = BusRecorder::default();
    let writes = recorder.writes.clone();

    let mut cpu = Z80::new(Frequency::from_mhz(4), Memory::new(), Some(Box::new(recorder)));
    cpu.memory.load(0x9000, &[0x01, 0x02, 0x03]);
    cpu.state.set_register(Register::B, 0x03);
    cpu.state.set_register(Register::C, 0x10);
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x9000);

    run_program(&mut cpu, &[0xED, 0xB3, 0x76]);

    assert_eq!(*writes.borrow(), vec![(0x0210, 0x01), (0x0110, 0x02), (0x0010, 0x03)]);
    assert_eq!(cpu.state.get_register(Register::B), 0x00);
    assert!(cpu.state.get_flag(Flags::Zero));
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0x9003);
    assert_eq!(cpu.state.t_states, 21 + 21 + 16 + 4);
}

#[test]
fn nibble_rotates() {
    let mut cpu = power_on();
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x9000);
    cpu.state.set_register(Register::A, 0x5C);
    cpu.memory.write_u8(0x9000, 0xAB);

    run_program(&mut cpu, &[0xED, 0x6F, 0x76]);

    assert_eq!(cpu.memory.read_u8(0x9000), 0xBC);
    assert_eq!(cpu.state.get_register(Register::A), 0x5A);
    assert!(cpu.state.get_flag(Flags::Parity));
    assert!(!cpu.state.get_flag(Flags::Sign));

    let mut cpu = power_on();
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x9000);
    cpu.state.set_register(Register::A, 0x5C);
    cpu.memory.write_u8(0x9000, 0xAB);

    run_program(&mut cpu, &[0xED, 0x67, 0x76]);

    assert_eq!(cpu.memory.read_u8(0x9000), 0xCA);
    assert_eq!(cpu.state.get_register(Register::A), 0x5B);
}

#[test]
fn indexed_bit_op_copies_result_to_register() {
    let mut cpu = power_on();
    cpu.state.ix = 0x9000;
    cpu.memory.write_u8(0x9005, 0x81);

    // RLC (IX+5) with the undocumented copy into B
    run_program(&mut cpu, &[0xDD, 0xCB, 0x05, 0x00, 0x76]);

    assert_eq!(cpu.memory.read_u8(0x9005), 0x03);
    assert_eq!(cpu.state.get_register(Register::B), 0x03);
    assert!(cpu.state.get_flag(Flags::Carry));
}

#[test]
fn indexed_bit_test_leaks_address_high_byte() {
    let mut cpu = power_on();
    cpu.state.ix = 0x2000;
    // bit 3 of the operand is set, but the effective address high
    // byte 0x20 decides F3/F5
    cpu.memory.write_u8(0x2040, 0x08);

    run_program(&mut cpu, &[0xDD, 0xCB, 0x40, 0x46, 0x76]);

    assert!(cpu.state.get_flag(Flags::Zero));
    assert!(cpu.state.get_flag(Flags::Parity));
    assert!(cpu.state.get_flag(Flags::HalfCarry));
    assert!(cpu.state.get_flag(Flags::F5));
    assert!(!cpu.state.get_flag(Flags::F3));
}

#[test]
fn memory_bit_test_takes_undocumented_bits_from_operand() {
    let mut cpu = power_on();
    cpu.state.set_register_pair_value(RegisterPair::HL, 0x4444);
    cpu.memory.write_u8(0x4444, 0x28);

    // BIT 5,(HL)
    run_program(&mut cpu, &[0xCB, 0x6E, 0x76]);

    assert!(!cpu.state.get_flag(Flags::Zero));
    assert!(cpu.state.get_flag(Flags::F3));
    assert!(cpu.state.get_flag(Flags::F5));
}

#[test]
fn relative_jumps_wrap_modulo_address_space() {
    let mut cpu = power_on();
    cpu.memory.load(0x0000, &[0x18, 0xFC]);
    cpu.state.pc = 0x0000;
    assert!(cpu.step());
    assert_eq!(cpu.state.pc, 0xFFFE);

    let mut cpu = power_on();
    cpu.memory.load(0xFFFE, &[0x18, 0x02]);
    cpu.state.pc = 0xFFFE;
    assert!(cpu.step());
    assert_eq!(cpu.state.pc, 0x0002);
}

#[test]
fn preview_does_not_disturb_state() {
    let mut cpu = power_on();
    cpu.memory.load(ORIGIN, &[0x21, 0x00, 0x50]);
    cpu.state.pc = ORIGIN;
    let before = cpu.state.clone();

    assert_eq!(cpu.preview_byte(0), 0x21);
    assert_eq!(cpu.preview_word(1), 0x5000);
    assert_eq!(cpu.state, before);
}

#[test]
fn breakpoints_stop_checked_stepping() {
    let mut cpu = power_on();
    cpu.memory.load(ORIGIN, &[0x00, 0x00, 0x76]);
    cpu.state.pc = ORIGIN;
    cpu.add_breakpoint(ORIGIN + 1);

    cpu.step_checked().unwrap();
    assert_eq!(cpu.state.pc, ORIGIN + 1);

    assert!(matches!(cpu.step_checked(), Err(Z80Error::Breakpoint)));
    assert_eq!(cpu.state.pc, ORIGIN + 1);

    cpu.remove_breakpoint(ORIGIN + 1);
    cpu.step_checked().unwrap();
    assert_eq!(cpu.state.pc, ORIGIN + 2);
}

#[test]
fn elapsed_time_follows_the_clock() {
    let mut cpu = Z80::new(Frequency::from_mhz(1), Memory::new(), None);
    cpu.memory.load(ORIGIN, &[0x00]);
    cpu.state.pc = ORIGIN;

    assert!(cpu.step());
    assert_eq!(cpu.state.t_states, 4);
    assert_eq!(cpu.elapsed(), Duration::from_micros(4));
}

#[test]
fn memory_words_wrap_at_the_top_of_the_address_space() {
    let mut memory = Memory::new();
    memory.write_leu16(0xFFFF, 0x1234);
    assert_eq!(memory.read_u8(0xFFFF), 0x34);
    assert_eq!(memory.read_u8(0x0000), 0x12);
    assert_eq!(memory.read_leu16(0xFFFF), 0x1234);

    memory.load(0xFFFF, &[0x01, 0x02]);
    assert_eq!(memory.read_u8(0xFFFF), 0x01);
    assert_eq!(memory.read_u8(0x0000), 0x02);

    memory.reset();
    assert_eq!(memory.read_u8(0xFFFF), 0x00);
    assert_eq!(memory.read_u8(0x0000), 0x00);
}

#[test]
fn reset_restores_power_on_state() {
    let mut cpu = power_on();
    run_program(&mut cpu, &[0x21, 0x00, 0x50, 0x76]);

    cpu.reset();
    assert_eq!(cpu.state, Z80State::default());
    assert_eq!(cpu.state.get_register_pair_value(RegisterPair::HL), 0xFFFF);
    assert_eq!(cpu.state.sp, 0xFFFF);
    assert_eq!(cpu.state.pc, 0x0000);
    assert_eq!(cpu.state.t_states, 0);
}

#[test]
fn dump_state_formats_registers() {
    let mut cpu = power_on();
    let mut out = String::new();
    cpu.dump_state(&mut out).unwrap();
    assert!(out.contains("PC: 0x0000"));
    assert!(out.contains("IFF1"));

    cpu.memory.load(ORIGIN, &[0x21, 0x00, 0x50]);
    cpu.state.pc = ORIGIN;
    cpu.decode_next();
    let mut out = String::new();
    cpu.dump_decoded(&mut out).unwrap();
    assert!(out.contains("21 00 50"));
}
