use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::{Identity, MultiscalarMul};
use rand::{Rng, RngCore};
use rand::seq::SliceRandom;
use rayon::prelude::*;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use thiserror::Error;

pub const POINT_LEN: usize = 32;

const GENERATOR_DOMAIN: &[u8] = b"elgamal_shuffle_lib generators v1";
const CHALLENGE_E_DOMAIN: &[u8] = b"elgamal_shuffle_lib challenge e v1";
const CHALLENGE_V_DOMAIN: &[u8] = b"elgamal_shuffle_lib challenge v v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShuffleError {
    #[error("empty ciphertext batch")]
    EmptyBatch,
    #[error("mismatched lengths in shuffle inputs")]
    LengthMismatch,
    #[error("malformed group element encoding")]
    MalformedPoint,
    #[error("malformed shuffle proof encoding")]
    MalformedProof,
    #[error("shuffle proof rejected")]
    ProofRejected,
}

// (a, b) = (g^t, m + t*pk) in additive notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ciphertext {
    pub a: RistrettoPoint,
    pub b: RistrettoPoint,
}

impl Ciphertext {
    fn reencrypt(&self, pk: &RistrettoPoint, s: &Scalar) -> Ciphertext {
        Ciphertext {
            a: self.a + RISTRETTO_BASEPOINT_POINT * s,
            b: self.b + pk * s,
        }
    }
}

pub fn random_scalar(rng: &mut impl RngCore) -> Scalar {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

pub fn random_point(rng: &mut impl RngCore) -> RistrettoPoint {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    RistrettoPoint::from_uniform_bytes(&wide)
}

pub fn keygen(rng: &mut impl RngCore) -> (Scalar, RistrettoPoint) {
    let sk = random_scalar(rng);
    (sk, RISTRETTO_BASEPOINT_POINT * sk)
}

pub fn encrypt(pk: &RistrettoPoint, m: &RistrettoPoint, rng: &mut impl RngCore) -> Ciphertext {
    let t = random_scalar(rng);
    Ciphertext {
        a: RISTRETTO_BASEPOINT_POINT * t,
        b: m + pk * t,
    }
}

// b - sk*a: the plaintext once sk was the last remaining share, otherwise
// a ciphertext under the remaining cumulative key.
pub fn peel(ct: &Ciphertext, sk: &Scalar) -> RistrettoPoint {
    ct.b - ct.a * sk
}

pub fn point_bytes(p: &RistrettoPoint) -> Vec<u8> {
    p.compress().as_bytes().to_vec()
}

pub fn point_from_bytes(bytes: &[u8]) -> Result<RistrettoPoint, ShuffleError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| ShuffleError::MalformedPoint)?;
    CompressedRistretto(arr)
        .decompress()
        .ok_or(ShuffleError::MalformedPoint)
}

pub fn random_permutation(n: usize, rng: &mut impl Rng) -> Vec<usize> {
    let mut pi: Vec<usize> = (0..n).collect();
    pi.shuffle(rng);
    pi
}

// Prover and verifier derive the same generators from the batch size.
pub fn derive_generators(n: usize) -> Vec<RistrettoPoint> {
    let mut xof = Shake256::default();
    xof.update(GENERATOR_DOMAIN);
    xof.update(&(n as u64).to_le_bytes());
    let mut reader = xof.finalize_xof();
    (0..n)
        .map(|_| {
            let mut wide = [0u8; 64];
            reader.read(&mut wide);
            RistrettoPoint::from_uniform_bytes(&wide)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleProof {
    // pedersen commitments to the permutation matrix
    u_n: Vec<RistrettoPoint>,
    // bridging commitments
    big_b_n: Vec<RistrettoPoint>,
    big_a_prime: RistrettoPoint,
    big_b_prime_n: Vec<RistrettoPoint>,
    big_c_prime: RistrettoPoint,
    big_d_prime: RistrettoPoint,
    big_f_prime: Ciphertext,
    k_a: Scalar,
    k_b_n: Vec<Scalar>,
    k_c: Scalar,
    k_d: Scalar,
    k_e_n: Vec<Scalar>,
    k_f: Scalar,
}

// Terelius-Wikstrom shuffle argument: output[i] re-encrypts input[pi[i]],
// and the proof shows the output batch is a permuted re-encryption of the
// input batch under pk.
pub fn shuffle(
    pi: &[usize],
    pk: &RistrettoPoint,
    inputs: &[Ciphertext],
    rng: &mut impl RngCore,
) -> Result<(Vec<Ciphertext>, ShuffleProof), ShuffleError> {
    let n = inputs.len();
    if n == 0 {
        return Err(ShuffleError::EmptyBatch);
    }
    if pi.len() != n {
        return Err(ShuffleError::LengthMismatch);
    }
    let h_n = derive_generators(n);

    // inv[pi[i]] = i
    let mut inv = vec![0usize; n];
    for (i, &p) in pi.iter().enumerate() {
        inv[p] = i;
    }

    // Per-output-slot commitment and re-encryption exponents.
    let rho_n: Vec<Scalar> = (0..n).map(|_| random_scalar(rng)).collect();
    let sigma_n: Vec<Scalar> = (0..n).map(|_| random_scalar(rng)).collect();

    let outputs: Vec<Ciphertext> = (0..n)
        .into_par_iter()
        .map(|i| inputs[pi[i]].reencrypt(pk, &sigma_n[i]))
        .collect();

    // u_i = g^{rho_i} + h_{pi^{-1}(i)}
    let u_n: Vec<RistrettoPoint> = (0..n)
        .into_par_iter()
        .map(|i| RISTRETTO_BASEPOINT_POINT * rho_n[i] + h_n[inv[i]])
        .collect();

    let e_n = challenge_e(pk, inputs, &outputs, n);
    // e'_i = e_{pi(i)}
    let e_prime_n: Vec<Scalar> = (0..n).map(|i| e_n[pi[i]]).collect();

    // Bridging commitments: B_i = g^{b_i} + e'_i * B_{i-1}, B_{-1} = h_0.
    let b_n: Vec<Scalar> = (0..n).map(|_| random_scalar(rng)).collect();
    let mut big_b_n = Vec::with_capacity(n);
    let mut prev = h_n[0];
    for i in 0..n {
        let big_b = RISTRETTO_BASEPOINT_POINT * b_n[i] + prev * e_prime_n[i];
        big_b_n.push(big_b);
        prev = big_b;
    }

    // Proof commitments.
    let alpha = random_scalar(rng);
    let beta_n: Vec<Scalar> = (0..n).map(|_| random_scalar(rng)).collect();
    let epsilon_n: Vec<Scalar> = (0..n).map(|_| random_scalar(rng)).collect();
    let gamma = random_scalar(rng);
    let delta = random_scalar(rng);
    let phi = random_scalar(rng);

    let big_a_prime = RISTRETTO_BASEPOINT_POINT * alpha
        + RistrettoPoint::multiscalar_mul(&epsilon_n, &h_n);

    let big_b_prime_n: Vec<RistrettoPoint> = (0..n)
        .into_par_iter()
        .map(|i| {
            let b_prev = if i == 0 { h_n[0] } else { big_b_n[i - 1] };
            RISTRETTO_BASEPOINT_POINT * beta_n[i] + b_prev * epsilon_n[i]
        })
        .collect();

    let big_c_prime = RISTRETTO_BASEPOINT_POINT * gamma;
    let big_d_prime = RISTRETTO_BASEPOINT_POINT * delta;

    // F' = sum_i epsilon_i * w'_i - Enc(0; phi)
    let big_f_prime = Ciphertext {
        a: RistrettoPoint::multiscalar_mul(&epsilon_n, outputs.iter().map(|w| w.a))
            - RISTRETTO_BASEPOINT_POINT * phi,
        b: RistrettoPoint::multiscalar_mul(&epsilon_n, outputs.iter().map(|w| w.b)) - pk * phi,
    };

    let v = challenge_v(
        pk,
        &u_n,
        &big_b_n,
        &big_a_prime,
        &big_b_prime_n,
        &big_c_prime,
        &big_d_prime,
        &big_f_prime,
    );

    // Responses.
    let a: Scalar = (0..n).map(|i| rho_n[i] * e_n[i]).sum();
    let c: Scalar = rho_n.iter().sum();
    let f: Scalar = (0..n).map(|i| sigma_n[i] * e_prime_n[i]).sum();
    let mut d = b_n[0];
    for i in 1..n {
        d = b_n[i] + e_prime_n[i] * d;
    }

    let k_a = v * a + alpha;
    let k_b_n: Vec<Scalar> = (0..n).map(|i| v * b_n[i] + beta_n[i]).collect();
    let k_c = v * c + gamma;
    let k_d = v * d + delta;
    let k_e_n: Vec<Scalar> = (0..n).map(|i| v * e_prime_n[i] + epsilon_n[i]).collect();
    let k_f = v * f + phi;

    let proof = ShuffleProof {
        u_n,
        big_b_n,
        big_a_prime,
        big_b_prime_n,
        big_c_prime,
        big_d_prime,
        big_f_prime,
        k_a,
        k_b_n,
        k_c,
        k_d,
        k_e_n,
        k_f,
    };
    Ok((outputs, proof))
}

pub fn verify(
    pk: &RistrettoPoint,
    inputs: &[Ciphertext],
    outputs: &[Ciphertext],
    proof: &ShuffleProof,
) -> Result<(), ShuffleError> {
    let n = inputs.len();
    if n == 0 {
        return Err(ShuffleError::EmptyBatch);
    }
    if outputs.len() != n
        || proof.u_n.len() != n
        || proof.big_b_n.len() != n
        || proof.big_b_prime_n.len() != n
        || proof.k_b_n.len() != n
        || proof.k_e_n.len() != n
    {
        return Err(ShuffleError::LengthMismatch);
    }
    let h_n = derive_generators(n);

    let e_n = challenge_e(pk, inputs, outputs, n);
    let v = challenge_v(
        pk,
        &proof.u_n,
        &proof.big_b_n,
        &proof.big_a_prime,
        &proof.big_b_prime_n,
        &proof.big_c_prime,
        &proof.big_d_prime,
        &proof.big_f_prime,
    );

    // A = sum e_i * u_i
    let big_a = RistrettoPoint::multiscalar_mul(&e_n, &proof.u_n);
    // F = sum e_i * w_i
    let big_f = Ciphertext {
        a: RistrettoPoint::multiscalar_mul(&e_n, inputs.iter().map(|w| w.a)),
        b: RistrettoPoint::multiscalar_mul(&e_n, inputs.iter().map(|w| w.b)),
    };
    // C = sum u_i - sum h_i
    let sum = |ps: &[RistrettoPoint]| {
        ps.iter().fold(RistrettoPoint::identity(), |acc, p| acc + p)
    };
    let big_c = sum(&proof.u_n) - sum(&h_n);
    // D = B_{n-1} - (prod e_i) * h_0
    let e_prod: Scalar = e_n.iter().product();
    let big_d = proof.big_b_n[n - 1] - h_n[0] * e_prod;

    // (1)  v*A + A' == g^{k_a} + sum k_e_i * h_i
    let lhs_1 = big_a * v + proof.big_a_prime;
    let rhs_1 = RISTRETTO_BASEPOINT_POINT * proof.k_a
        + RistrettoPoint::multiscalar_mul(&proof.k_e_n, &h_n);
    if lhs_1 != rhs_1 {
        return Err(ShuffleError::ProofRejected);
    }

    // (2)  v*B_i + B'_i == g^{k_b_i} + k_e_i * B_{i-1}
    let ok_2 = (0..n).into_par_iter().all(|i| {
        let b_prev = if i == 0 { h_n[0] } else { proof.big_b_n[i - 1] };
        proof.big_b_n[i] * v + proof.big_b_prime_n[i]
            == RISTRETTO_BASEPOINT_POINT * proof.k_b_n[i] + b_prev * proof.k_e_n[i]
    });
    if !ok_2 {
        return Err(ShuffleError::ProofRejected);
    }

    // (3)  v*C + C' == g^{k_c}
    if big_c * v + proof.big_c_prime != RISTRETTO_BASEPOINT_POINT * proof.k_c {
        return Err(ShuffleError::ProofRejected);
    }

    // (4)  v*D + D' == g^{k_d}
    if big_d * v + proof.big_d_prime != RISTRETTO_BASEPOINT_POINT * proof.k_d {
        return Err(ShuffleError::ProofRejected);
    }

    // (5)  v*F + F' == -Enc(0; k_f) + sum k_e_i * w'_i
    let lhs_5a = big_f.a * v + proof.big_f_prime.a;
    let lhs_5b = big_f.b * v + proof.big_f_prime.b;
    let rhs_5a = RistrettoPoint::multiscalar_mul(&proof.k_e_n, outputs.iter().map(|w| w.a))
        - RISTRETTO_BASEPOINT_POINT * proof.k_f;
    let rhs_5b = RistrettoPoint::multiscalar_mul(&proof.k_e_n, outputs.iter().map(|w| w.b))
        - pk * proof.k_f;
    if lhs_5a != rhs_5a || lhs_5b != rhs_5b {
        return Err(ShuffleError::ProofRejected);
    }

    Ok(())
}

fn absorb_point(xof: &mut Shake256, p: &RistrettoPoint) {
    xof.update(p.compress().as_bytes());
}

fn read_scalar(reader: &mut impl XofReader) -> Scalar {
    let mut wide = [0u8; 64];
    reader.read(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn challenge_e(
    pk: &RistrettoPoint,
    inputs: &[Ciphertext],
    outputs: &[Ciphertext],
    n: usize,
) -> Vec<Scalar> {
    let mut xof = Shake256::default();
    xof.update(CHALLENGE_E_DOMAIN);
    absorb_point(&mut xof, pk);
    for w in inputs.iter().chain(outputs.iter()) {
        absorb_point(&mut xof, &w.a);
        absorb_point(&mut xof, &w.b);
    }
    let mut reader = xof.finalize_xof();
    (0..n).map(|_| read_scalar(&mut reader)).collect()
}

#[allow(clippy::too_many_arguments)]
fn challenge_v(
    pk: &RistrettoPoint,
    u_n: &[RistrettoPoint],
    big_b_n: &[RistrettoPoint],
    big_a_prime: &RistrettoPoint,
    big_b_prime_n: &[RistrettoPoint],
    big_c_prime: &RistrettoPoint,
    big_d_prime: &RistrettoPoint,
    big_f_prime: &Ciphertext,
) -> Scalar {
    let mut xof = Shake256::default();
    xof.update(CHALLENGE_V_DOMAIN);
    absorb_point(&mut xof, pk);
    for p in u_n.iter().chain(big_b_n.iter()).chain(big_b_prime_n.iter()) {
        absorb_point(&mut xof, p);
    }
    absorb_point(&mut xof, big_a_prime);
    absorb_point(&mut xof, big_c_prime);
    absorb_point(&mut xof, big_d_prime);
    absorb_point(&mut xof, &big_f_prime.a);
    absorb_point(&mut xof, &big_f_prime.b);
    read_scalar(&mut xof.finalize_xof())
}

impl ShuffleProof {
    // u32-le batch size, then fixed 32-byte chunks in field order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.u_n.len();
        let mut out = Vec::with_capacity(4 + 32 * (5 * n + 9));
        out.extend_from_slice(&(n as u32).to_le_bytes());
        let put_p = |buf: &mut Vec<u8>, p: &RistrettoPoint| {
            buf.extend_from_slice(p.compress().as_bytes())
        };
        for p in &self.u_n {
            put_p(&mut out, p);
        }
        for p in &self.big_b_n {
            put_p(&mut out, p);
        }
        put_p(&mut out, &self.big_a_prime);
        for p in &self.big_b_prime_n {
            put_p(&mut out, p);
        }
        put_p(&mut out, &self.big_c_prime);
        put_p(&mut out, &self.big_d_prime);
        put_p(&mut out, &self.big_f_prime.a);
        put_p(&mut out, &self.big_f_prime.b);
        out.extend_from_slice(self.k_a.as_bytes());
        for s in &self.k_b_n {
            out.extend_from_slice(s.as_bytes());
        }
        out.extend_from_slice(self.k_c.as_bytes());
        out.extend_from_slice(self.k_d.as_bytes());
        for s in &self.k_e_n {
            out.extend_from_slice(s.as_bytes());
        }
        out.extend_from_slice(self.k_f.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ShuffleProof, ShuffleError> {
        if bytes.len() < 4 {
            return Err(ShuffleError::MalformedProof);
        }
        let n = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        if n == 0 || bytes.len() != 4 + 32 * (5 * n + 9) {
            return Err(ShuffleError::MalformedProof);
        }
        let mut off = 4;
        let take_p = |buf: &[u8], off: &mut usize| -> Result<RistrettoPoint, ShuffleError> {
            let arr: [u8; 32] = buf[*off..*off + 32].try_into().unwrap();
            *off += 32;
            CompressedRistretto(arr)
                .decompress()
                .ok_or(ShuffleError::MalformedProof)
        };
        let take_s = |buf: &[u8], off: &mut usize| -> Result<Scalar, ShuffleError> {
            let arr: [u8; 32] = buf[*off..*off + 32].try_into().unwrap();
            *off += 32;
            Option::from(Scalar::from_canonical_bytes(arr)).ok_or(ShuffleError::MalformedProof)
        };
        let u_n = (0..n)
            .map(|_| take_p(bytes, &mut off))
            .collect::<Result<Vec<_>, _>>()?;
        let big_b_n = (0..n)
            .map(|_| take_p(bytes, &mut off))
            .collect::<Result<Vec<_>, _>>()?;
        let big_a_prime = take_p(bytes, &mut off)?;
        let big_b_prime_n = (0..n)
            .map(|_| take_p(bytes, &mut off))
            .collect::<Result<Vec<_>, _>>()?;
        let big_c_prime = take_p(bytes, &mut off)?;
        let big_d_prime = take_p(bytes, &mut off)?;
        let big_f_prime = Ciphertext {
            a: take_p(bytes, &mut off)?,
            b: take_p(bytes, &mut off)?,
        };
        let k_a = take_s(bytes, &mut off)?;
        let k_b_n = (0..n)
            .map(|_| take_s(bytes, &mut off))
            .collect::<Result<Vec<_>, _>>()?;
        let k_c = take_s(bytes, &mut off)?;
        let k_d = take_s(bytes, &mut off)?;
        let k_e_n = (0..n)
            .map(|_| take_s(bytes, &mut off))
            .collect::<Result<Vec<_>, _>>()?;
        let k_f = take_s(bytes, &mut off)?;
        Ok(ShuffleProof {
            u_n,
            big_b_n,
            big_a_prime,
            big_b_prime_n,
            big_c_prime,
            big_d_prime,
            big_f_prime,
            k_a,
            k_b_n,
            k_c,
            k_d,
            k_e_n,
            k_f,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn elgamal_roundtrip() {
        let mut rng = rng();
        let (sk, pk) = keygen(&mut rng);
        let m = random_point(&mut rng);
        let ct = encrypt(&pk, &m, &mut rng);
        assert_eq!(peel(&ct, &sk), m);
    }

    #[test]
    fn onion_peels_across_two_hops() {
        let mut rng = rng();
        let (sk0, pk0) = keygen(&mut rng);
        let (sk1, pk1) = keygen(&mut rng);
        let m = random_point(&mut rng);
        // Outer layer under the cumulative key pk0 + pk1.
        let ct = encrypt(&(pk0 + pk1), &m, &mut rng);
        // Hop 0 strips its share; the residue is a ciphertext under pk1.
        let mid = Ciphertext {
            a: ct.a,
            b: peel(&ct, &sk0),
        };
        // Hop 1 reblinds before peeling, as the pipeline does.
        let mid = mid.reencrypt(&pk1, &random_scalar(&mut rng));
        assert_eq!(peel(&mid, &sk1), m);
    }

    #[test]
    fn shuffle_proof_accepts_and_permutes() {
        let mut rng = rng();
        let (sk, pk) = keygen(&mut rng);
        let msgs: Vec<RistrettoPoint> = (0..5).map(|_| random_point(&mut rng)).collect();
        let inputs: Vec<Ciphertext> = msgs.iter().map(|m| encrypt(&pk, m, &mut rng)).collect();
        let pi = random_permutation(5, &mut rng);

        let (outputs, proof) = shuffle(&pi, &pk, &inputs, &mut rng).unwrap();
        verify(&pk, &inputs, &outputs, &proof).unwrap();
        for i in 0..5 {
            assert_eq!(peel(&outputs[i], &sk), msgs[pi[i]]);
        }
    }

    #[test]
    fn shuffle_proof_single_element() {
        let mut rng = rng();
        let (_, pk) = keygen(&mut rng);
        let inputs = vec![encrypt(&pk, &random_point(&mut rng), &mut rng)];
        let (outputs, proof) = shuffle(&[0], &pk, &inputs, &mut rng).unwrap();
        verify(&pk, &inputs, &outputs, &proof).unwrap();
    }

    #[test]
    fn tampered_output_rejected() {
        let mut rng = rng();
        let (_, pk) = keygen(&mut rng);
        let inputs: Vec<Ciphertext> = (0..4)
            .map(|_| encrypt(&pk, &random_point(&mut rng), &mut rng))
            .collect();
        let pi = random_permutation(4, &mut rng);
        let (mut outputs, proof) = shuffle(&pi, &pk, &inputs, &mut rng).unwrap();
        outputs.swap(0, 1);
        assert_eq!(
            verify(&pk, &inputs, &outputs, &proof),
            Err(ShuffleError::ProofRejected)
        );
    }

    #[test]
    fn wrong_public_key_rejected() {
        let mut rng = rng();
        let (_, pk) = keygen(&mut rng);
        let (_, other_pk) = keygen(&mut rng);
        let inputs: Vec<Ciphertext> = (0..3)
            .map(|_| encrypt(&pk, &random_point(&mut rng), &mut rng))
            .collect();
        let pi = random_permutation(3, &mut rng);
        let (outputs, proof) = shuffle(&pi, &pk, &inputs, &mut rng).unwrap();
        assert_eq!(
            verify(&other_pk, &inputs, &outputs, &proof),
            Err(ShuffleError::ProofRejected)
        );
    }

    #[test]
    fn proof_bytes_roundtrip() {
        let mut rng = rng();
        let (_, pk) = keygen(&mut rng);
        let inputs: Vec<Ciphertext> = (0..4)
            .map(|_| encrypt(&pk, &random_point(&mut rng), &mut rng))
            .collect();
        let pi = random_permutation(4, &mut rng);
        let (outputs, proof) = shuffle(&pi, &pk, &inputs, &mut rng).unwrap();

        let decoded = ShuffleProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(decoded, proof);
        verify(&pk, &inputs, &outputs, &decoded).unwrap();

        assert_eq!(
            ShuffleProof::from_bytes(&proof.to_bytes()[..40]),
            Err(ShuffleError::MalformedProof)
        );
    }

    #[test]
    fn random_permutation_is_bijection() {
        let mut rng = rng();
        let pi = random_permutation(64, &mut rng);
        let mut seen = vec![false; 64];
        for &p in &pi {
            assert!(!seen[p]);
            seen[p] = true;
        }
    }
}
