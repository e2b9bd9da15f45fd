//! Tests for fragment header accessors and validation rules.

use rstest::rstest;

use crate::fragment::{
    FragmentFlags,
    FragmentHeader,
    FragmentIndex,
    MAX_FRAGMENTS,
    MalformedReason,
    MessageId,
};

fn header(index: u32, offset: u32, len: u16, total: u32, flags: FragmentFlags) -> FragmentHeader {
    FragmentHeader::new(
        MessageId::new(9),
        FragmentIndex::new(index),
        total,
        offset,
        len,
        flags,
    )
}

#[test]
fn fragment_header_exposes_fields() {
    let header = header(2, 974, 51, 1025, FragmentFlags::LAST);
    assert_eq!(header.message_id(), MessageId::new(9));
    assert_eq!(header.fragment_index(), FragmentIndex::new(2));
    assert_eq!(header.total_len(), 1025);
    assert_eq!(header.offset(), 974);
    assert_eq!(header.payload_len(), 51);
    assert!(header.is_last_fragment());
    assert_eq!(header.byte_range(), 974..1025);
}

#[rstest]
#[case::first(header(0, 0, 10, 25, FragmentFlags::NONE), 10)]
#[case::last(header(2, 20, 5, 25, FragmentFlags::LAST), 5)]
#[case::empty_message(header(0, 0, 0, 0, FragmentFlags::LAST), 0)]
fn valid_headers_pass(#[case] header: FragmentHeader, #[case] carried: usize) {
    assert_eq!(header.validate(carried), Ok(()));
}

#[test]
fn payload_length_must_match_carried_bytes() {
    assert_eq!(
        header(0, 0, 10, 25, FragmentFlags::NONE).validate(9),
        Err(MalformedReason::LengthMismatch {
            declared: 10,
            carried: 9,
        })
    );
}

#[rstest]
#[case(20, 6, 25)]
#[case(u32::MAX, 1, u32::MAX)]
fn fragment_must_end_within_message(#[case] offset: u32, #[case] len: u16, #[case] total: u32) {
    assert_eq!(
        header(1, offset, len, total, FragmentFlags::NONE).validate(usize::from(len)),
        Err(MalformedReason::OutOfBounds {
            offset,
            payload_len: len,
            total_len: total,
        })
    );
}

#[test]
fn index_must_fit_acknowledgment_bitmap() {
    let index = u32::try_from(MAX_FRAGMENTS).expect("fits");
    assert_eq!(
        header(index, 0, 1, 25, FragmentFlags::NONE).validate(1),
        Err(MalformedReason::IndexOutOfRange {
            index: FragmentIndex::new(index),
        })
    );
}

#[test]
fn last_flag_must_mark_final_bytes() {
    assert_eq!(
        header(0, 0, 10, 25, FragmentFlags::LAST).validate(10),
        Err(MalformedReason::MisplacedLastFlag {
            index: FragmentIndex::zero(),
        })
    );
}
