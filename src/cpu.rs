//! Guest-CPU register contract.
//!
//! The Z80 interpreter itself comes from the `iz80` crate; the dispatch
//! engine never touches it directly. Everything it needs from the guest —
//! reading call arguments, writing results, steering PC/SP, reflecting the
//! result code in the Zero flag — goes through the `GuestRegisters`
//! accessor trait, so handlers can be exercised against a plain fake
//! register file in tests.

use iz80::{Flag, Reg16, Reg8, Registers};

pub trait GuestRegisters {
    fn a(&self) -> u8;
    fn set_a(&mut self, value: u8);
    fn b(&self) -> u8;
    fn set_b(&mut self, value: u8);
    fn c(&self) -> u8;
    fn set_c(&mut self, value: u8);
    fn d(&self) -> u8;
    fn set_d(&mut self, value: u8);
    fn e(&self) -> u8;
    fn set_e(&mut self, value: u8);
    fn h(&self) -> u8;
    fn set_h(&mut self, value: u8);
    fn l(&self) -> u8;
    fn set_l(&mut self, value: u8);

    fn bc(&self) -> u16;
    fn set_bc(&mut self, value: u16);
    fn de(&self) -> u16;
    fn set_de(&mut self, value: u16);
    fn hl(&self) -> u16;
    fn set_hl(&mut self, value: u16);
    fn sp(&self) -> u16;
    fn set_sp(&mut self, value: u16);
    fn pc(&self) -> u16;
    fn set_pc(&mut self, value: u16);

    fn zero(&self) -> bool;
    fn set_zero(&mut self, value: bool);
    fn set_carry(&mut self, value: bool);
}

/// Adapter over the interpreter's register file.
pub struct Z80Regs<'a>(pub &'a mut Registers);

impl GuestRegisters for Z80Regs<'_> {
    fn a(&self) -> u8 {
        self.0.get8(Reg8::A)
    }
    fn set_a(&mut self, value: u8) {
        self.0.set8(Reg8::A, value);
    }
    fn b(&self) -> u8 {
        self.0.get8(Reg8::B)
    }
    fn set_b(&mut self, value: u8) {
        self.0.set8(Reg8::B, value);
    }
    fn c(&self) -> u8 {
        self.0.get8(Reg8::C)
    }
    fn set_c(&mut self, value: u8) {
        self.0.set8(Reg8::C, value);
    }
    fn d(&self) -> u8 {
        self.0.get8(Reg8::D)
    }
    fn set_d(&mut self, value: u8) {
        self.0.set8(Reg8::D, value);
    }
    fn e(&self) -> u8 {
        self.0.get8(Reg8::E)
    }
    fn set_e(&mut self, value: u8) {
        self.0.set8(Reg8::E, value);
    }
    fn h(&self) -> u8 {
        self.0.get8(Reg8::H)
    }
    fn set_h(&mut self, value: u8) {
        self.0.set8(Reg8::H, value);
    }
    fn l(&self) -> u8 {
        self.0.get8(Reg8::L)
    }
    fn set_l(&mut self, value: u8) {
        self.0.set8(Reg8::L, value);
    }

    fn bc(&self) -> u16 {
        self.0.get16(Reg16::BC)
    }
    fn set_bc(&mut self, value: u16) {
        self.0.set16(Reg16::BC, value);
    }
    fn de(&self) -> u16 {
        self.0.get16(Reg16::DE)
    }
    fn set_de(&mut self, value: u16) {
        self.0.set16(Reg16::DE, value);
    }
    fn hl(&self) -> u16 {
        self.0.get16(Reg16::HL)
    }
    fn set_hl(&mut self, value: u16) {
        self.0.set16(Reg16::HL, value);
    }
    fn sp(&self) -> u16 {
        self.0.get16(Reg16::SP)
    }
    fn set_sp(&mut self, value: u16) {
        self.0.set16(Reg16::SP, value);
    }
    fn pc(&self) -> u16 {
        self.0.pc()
    }
    fn set_pc(&mut self, value: u16) {
        self.0.set_pc(value);
    }

    fn zero(&self) -> bool {
        self.0.get_flag(Flag::Z)
    }
    fn set_zero(&mut self, value: bool) {
        if value {
            self.0.set_flag(Flag::Z);
        } else {
            self.0.clear_flag(Flag::Z);
        }
    }
    fn set_carry(&mut self, value: bool) {
        if value {
            self.0.set_flag(Flag::C);
        } else {
            self.0.clear_flag(Flag::C);
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::GuestRegisters;

    /// Plain register file for exercising dispatch handlers without an
    /// interpreter.
    #[derive(Default)]
    pub struct FakeRegs {
        pub a: u8,
        pub b: u8,
        pub c: u8,
        pub d: u8,
        pub e: u8,
        pub h: u8,
        pub l: u8,
        pub sp: u16,
        pub pc: u16,
        pub zero: bool,
        pub carry: bool,
    }

    impl GuestRegisters for FakeRegs {
        fn a(&self) -> u8 {
            self.a
        }
        fn set_a(&mut self, value: u8) {
            self.a = value;
        }
        fn b(&self) -> u8 {
            self.b
        }
        fn set_b(&mut self, value: u8) {
            self.b = value;
        }
        fn c(&self) -> u8 {
            self.c
        }
        fn set_c(&mut self, value: u8) {
            self.c = value;
        }
        fn d(&self) -> u8 {
            self.d
        }
        fn set_d(&mut self, value: u8) {
            self.d = value;
        }
        fn e(&self) -> u8 {
            self.e
        }
        fn set_e(&mut self, value: u8) {
            self.e = value;
        }
        fn h(&self) -> u8 {
            self.h
        }
        fn set_h(&mut self, value: u8) {
            self.h = value;
        }
        fn l(&self) -> u8 {
            self.l
        }
        fn set_l(&mut self, value: u8) {
            self.l = value;
        }

        fn bc(&self) -> u16 {
            (self.b as u16) << 8 | self.c as u16
        }
        fn set_bc(&mut self, value: u16) {
            self.b = (value >> 8) as u8;
            self.c = value as u8;
        }
        fn de(&self) -> u16 {
            (self.d as u16) << 8 | self.e as u16
        }
        fn set_de(&mut self, value: u16) {
            self.d = (value >> 8) as u8;
            self.e = value as u8;
        }
        fn hl(&self) -> u16 {
            (self.h as u16) << 8 | self.l as u16
        }
        fn set_hl(&mut self, value: u16) {
            self.h = (value >> 8) as u8;
            self.l = value as u8;
        }
        fn sp(&self) -> u16 {
            self.sp
        }
        fn set_sp(&mut self, value: u16) {
            self.sp = value;
        }
        fn pc(&self) -> u16 {
            self.pc
        }
        fn set_pc(&mut self, value: u16) {
            self.pc = value;
        }

        fn zero(&self) -> bool {
            self.zero
        }
        fn set_zero(&mut self, value: bool) {
            self.zero = value;
        }
        fn set_carry(&mut self, value: bool) {
            self.carry = value;
        }
    }
}
