//! Equivalence properties of URL canonicalization.

use tracker_core::common::utils::{normalize_source_url, url_fingerprint};

#[test]
fn www_prefix_and_trailing_slash_are_equivalent() {
    let variants = [
        "https://mangahost.example/series/one-piece",
        "https://www.mangahost.example/series/one-piece",
        "https://mangahost.example/series/one-piece/",
        "https://www.mangahost.example/series/one-piece/",
    ];
    let expected = url_fingerprint(variants[0]);
    for variant in variants {
        assert_eq!(url_fingerprint(variant), expected, "{variant}");
    }
}

#[test]
fn tracking_params_are_equivalent_to_none() {
    assert_eq!(
        url_fingerprint("https://mangahost.example/series/op?utm_source=reader&utm_campaign=x"),
        url_fingerprint("https://mangahost.example/series/op"),
    );
    assert_eq!(
        url_fingerprint("https://mangahost.example/series/op?fbclid=abc123"),
        url_fingerprint("https://mangahost.example/series/op"),
    );
}

#[test]
fn identity_params_are_preserved() {
    assert_ne!(
        url_fingerprint("https://mangahost.example/series?id=1"),
        url_fingerprint("https://mangahost.example/series?id=2"),
    );
    // Mixing a tracking param in does not change the identity.
    assert_eq!(
        url_fingerprint("https://mangahost.example/series?id=1&utm_source=feed"),
        url_fingerprint("https://mangahost.example/series?id=1"),
    );
}

#[test]
fn different_paths_are_different() {
    assert_ne!(
        url_fingerprint("https://mangahost.example/series/one-piece"),
        url_fingerprint("https://mangahost.example/series/berserk"),
    );
}

#[test]
fn normalized_form_is_readable() {
    assert_eq!(
        normalize_source_url("https://WWW.MangaHost.Example/Series/One-Piece/?utm_source=x"),
        "https://mangahost.example/Series/One-Piece",
    );
}
