//! iced-x86 backend for candidate decoding.
//!
//! Collapses iced's rich instruction model down to what the inference
//! engine consumes: length, control-transfer class, and address-valued
//! operands. Immediates that could plausibly be addresses (32 bits and
//! up) are reported as absolute references; whether they land in the
//! image is the fact layer's concern, not the decoder's.

use iced_x86::{Decoder, DecoderError, DecoderOptions, FlowControl, OpKind, Register};

use crate::core::address::Addr;
use crate::core::instruction::{CandidateInstruction, InstructionClass, OperandReference};
use crate::disasm::{Architecture, CandidateDecoder, DecodeError, DecodeResult};

pub struct IcedDecoder {
    bits: u32,
    arch: Architecture,
}

impl IcedDecoder {
    pub fn new(arch: Architecture) -> Self {
        let bits = match arch {
            Architecture::X86 => 32,
            _ => 64,
        };
        Self { bits, arch }
    }

    fn classify(instr: &iced_x86::Instruction) -> InstructionClass {
        match instr.flow_control() {
            FlowControl::Next | FlowControl::Interrupt | FlowControl::XbeginXabortXend => {
                InstructionClass::Ordinary
            }
            FlowControl::UnconditionalBranch => InstructionClass::Branch,
            FlowControl::ConditionalBranch => InstructionClass::CondBranch,
            FlowControl::Call => InstructionClass::Call,
            FlowControl::Return => InstructionClass::Return,
            FlowControl::IndirectBranch => InstructionClass::IndirectBranch,
            FlowControl::IndirectCall => InstructionClass::IndirectCall,
            FlowControl::Exception => InstructionClass::Halt,
        }
    }

    fn operand_refs(
        instr: &iced_x86::Instruction,
        class: InstructionClass,
    ) -> Vec<OperandReference> {
        let mut out = Vec::new();
        for i in 0..instr.op_count() {
            let idx = i as u8;
            match instr.op_kind(i) {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    out.push(OperandReference::pc_relative(
                        idx,
                        Addr(instr.near_branch_target()),
                    ));
                }
                OpKind::FarBranch16 | OpKind::FarBranch32 => {
                    // Segment not modeled; the offset alone is the referent.
                    out.push(OperandReference::absolute(
                        idx,
                        Addr(instr.near_branch_target()),
                    ));
                }
                OpKind::Memory => {
                    if instr.is_ip_rel_memory_operand() {
                        out.push(OperandReference::pc_relative(
                            idx,
                            Addr(instr.ip_rel_memory_address()),
                        ));
                    } else if instr.memory_base() == Register::None
                        && instr.memory_index() == Register::None
                    {
                        out.push(OperandReference::absolute(
                            idx,
                            Addr(instr.memory_displacement64()),
                        ));
                    } else if class.is_indirect() {
                        out.push(OperandReference::indirect(idx));
                    }
                }
                OpKind::Register => {
                    if class.is_indirect() {
                        out.push(OperandReference::indirect(idx));
                    }
                }
                OpKind::Immediate32 => {
                    out.push(OperandReference::absolute(
                        idx,
                        Addr(instr.immediate32() as u64),
                    ));
                }
                OpKind::Immediate32to64 => {
                    out.push(OperandReference::absolute(
                        idx,
                        Addr(instr.immediate32to64() as u64),
                    ));
                }
                OpKind::Immediate64 => {
                    out.push(OperandReference::absolute(idx, Addr(instr.immediate64())));
                }
                _ => {}
            }
        }
        out
    }
}

impl CandidateDecoder for IcedDecoder {
    fn decode(&self, addr: Addr, bytes: &[u8]) -> DecodeResult<CandidateInstruction> {
        if bytes.is_empty() {
            return Err(DecodeError::InsufficientBytes);
        }
        let mut decoder = Decoder::new(self.bits, bytes, DecoderOptions::NONE);
        decoder.set_ip(addr.0);

        let instr = decoder.decode();
        if instr.is_invalid() {
            return match decoder.last_error() {
                DecoderError::NoMoreBytes => Err(DecodeError::InsufficientBytes),
                _ => Err(DecodeError::InvalidInstruction),
            };
        }
        let class = Self::classify(&instr);
        let operands = Self::operand_refs(&instr, class);
        Ok(CandidateInstruction {
            address: addr,
            length: instr.len() as u8,
            class,
            operands,
        })
    }

    fn max_instruction_len(&self) -> usize {
        15
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }
}
